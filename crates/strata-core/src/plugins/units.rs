//! Measurement units named in variable metadata.
//!
//! Each kind has one baseline unit; a conversion goes through the baseline,
//! so only units of the same kind convert into each other.

use std::fmt;

/// What a unit measures.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnitKind {
    Length,
    Mass,
    Volume,
    Temperature,
    TimeLarge,
    TimeSmall,
    MassProportion,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Unit {
    Millimeter,
    Centimeter,
    Feet,
    Meter,
    Kilometer,
    Microgram,
    Milligram,
    Gram,
    Kilogram,
    Milliliter,
    Liter,
    Celsius,
    Fahrenheit,
    Month,
    Year,
    Millisecond,
    Second,
    Minute,
    Hour,
    Day,
    Week,
    MicrogramPerGram,
    MilligramPerGram,
}

const ALL_UNITS: [Unit; 23] = [
    Unit::Millimeter,
    Unit::Centimeter,
    Unit::Feet,
    Unit::Meter,
    Unit::Kilometer,
    Unit::Microgram,
    Unit::Milligram,
    Unit::Gram,
    Unit::Kilogram,
    Unit::Milliliter,
    Unit::Liter,
    Unit::Celsius,
    Unit::Fahrenheit,
    Unit::Month,
    Unit::Year,
    Unit::Millisecond,
    Unit::Second,
    Unit::Minute,
    Unit::Hour,
    Unit::Day,
    Unit::Week,
    Unit::MicrogramPerGram,
    Unit::MilligramPerGram,
];

impl Unit {
    /// Look a unit up by one of its metadata labels (case-sensitive).
    #[must_use]
    pub fn find(label: &str) -> Option<Self> {
        ALL_UNITS
            .into_iter()
            .find(|unit| unit.labels().contains(&label))
    }

    /// Labels this unit appears under in metadata; the first is canonical.
    #[must_use]
    pub const fn labels(self) -> &'static [&'static str] {
        match self {
            Self::Millimeter => &["mm"],
            Self::Centimeter => &["cm"],
            Self::Feet => &["feet"],
            Self::Meter => &["m"],
            Self::Kilometer => &["km"],
            Self::Microgram => &["ug"],
            Self::Milligram => &["mg"],
            Self::Gram => &["g"],
            Self::Kilogram => &["kg"],
            Self::Milliliter => &["mL", "ml"],
            Self::Liter => &["L"],
            Self::Celsius => &["C"],
            Self::Fahrenheit => &["F"],
            Self::Month => &["months"],
            Self::Year => &["years", "Years"],
            Self::Millisecond => &["ms"],
            Self::Second => &["sec"],
            Self::Minute => &["min", "minutes"],
            Self::Hour => &["hours"],
            Self::Day => &["days"],
            Self::Week => &["weeks"],
            Self::MicrogramPerGram => &["ug/g"],
            Self::MilligramPerGram => &["mg/g"],
        }
    }

    #[must_use]
    pub const fn kind(self) -> UnitKind {
        match self {
            Self::Millimeter | Self::Centimeter | Self::Feet | Self::Meter | Self::Kilometer => {
                UnitKind::Length
            }
            Self::Microgram | Self::Milligram | Self::Gram | Self::Kilogram => UnitKind::Mass,
            Self::Milliliter | Self::Liter => UnitKind::Volume,
            Self::Celsius | Self::Fahrenheit => UnitKind::Temperature,
            Self::Month | Self::Year => UnitKind::TimeLarge,
            Self::Millisecond
            | Self::Second
            | Self::Minute
            | Self::Hour
            | Self::Day
            | Self::Week => UnitKind::TimeSmall,
            Self::MicrogramPerGram | Self::MilligramPerGram => UnitKind::MassProportion,
        }
    }

    #[must_use]
    pub fn is_compatible_with(self, other: Self) -> bool {
        self.kind() == other.kind()
    }

    /// Convert `value` from this unit into `output`. Callers check
    /// compatibility first.
    #[must_use]
    pub fn convert_to(self, output: Self, value: f64) -> f64 {
        output.from_baseline(self.to_baseline(value))
    }

    // Baselines: m, g, L, C, years, minutes, mg/g.
    fn to_baseline(self, n: f64) -> f64 {
        match self {
            Self::Millimeter | Self::Milligram | Self::Milliliter | Self::MicrogramPerGram => {
                n * 0.001
            }
            Self::Centimeter => n * 0.01,
            Self::Feet => n * 0.3048,
            Self::Kilometer | Self::Kilogram => n * 1000.0,
            Self::Microgram => n * 0.000_001,
            Self::Fahrenheit => (n - 32.0) * 5.0 / 9.0,
            Self::Month => n / 12.0,
            Self::Millisecond => n / 60_000.0,
            Self::Second => n / 60.0,
            Self::Hour => n * 60.0,
            Self::Day => n * 60.0 * 24.0,
            Self::Week => n * 60.0 * 24.0 * 7.0,
            Self::Meter
            | Self::Gram
            | Self::Liter
            | Self::Celsius
            | Self::Year
            | Self::Minute
            | Self::MilligramPerGram => n,
        }
    }

    fn from_baseline(self, n: f64) -> f64 {
        match self {
            Self::Millimeter | Self::Milligram | Self::Milliliter | Self::MicrogramPerGram => {
                n * 1000.0
            }
            Self::Centimeter => n * 100.0,
            Self::Feet => n / 0.3048,
            Self::Kilometer | Self::Kilogram => n * 0.001,
            Self::Microgram => n * 1_000_000.0,
            Self::Fahrenheit => n * 9.0 / 5.0 + 32.0,
            Self::Month => n * 12.0,
            Self::Millisecond => n * 60_000.0,
            Self::Second => n * 60.0,
            Self::Hour => n / 60.0,
            Self::Day => n / 60.0 / 24.0,
            Self::Week => n / 60.0 / 24.0 / 7.0,
            Self::Meter
            | Self::Gram
            | Self::Liter
            | Self::Celsius
            | Self::Year
            | Self::Minute
            | Self::MilligramPerGram => n,
        }
    }
}

impl fmt::Display for Unit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.labels()[0])
    }
}
