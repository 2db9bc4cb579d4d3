// Motion profile entries and the sequence table edited by the operator
//
// Text conversion rules:
// - both ',' and '.' are accepted as decimal separator on input
// - output always uses '.' with a fixed number of decimals per column
//   (speed 1, accel/decel 3, jerk 3, delay 0)
// - parsed decimals are rounded to the column precision, so a value read
//   back from its own display text is bit-identical

use crate::error::{ConversionError, ControlError};

/// Column index of a sequence table cell
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Column {
    Speed = 0,
    AccelDecel = 1,
    Jerk = 2,
    Delay = 3,
}

impl Column {
    pub const ALL: [Column; 4] = [
        Column::Speed,
        Column::AccelDecel,
        Column::Jerk,
        Column::Delay,
    ];

    /// Decimal places used when displaying this column
    pub fn decimals(self) -> usize {
        match self {
            Column::Speed => 1,
            Column::AccelDecel | Column::Jerk => 3,
            Column::Delay => 0,
        }
    }
}

impl TryFrom<usize> for Column {
    type Error = ControlError;

    fn try_from(index: usize) -> Result<Self, Self::Error> {
        Column::ALL
            .get(index)
            .copied()
            .ok_or(ControlError::UnknownColumn(index))
    }
}

/// Parse a non-negative decimal and round it to `decimals` places
pub fn parse_decimal(text: &str, decimals: usize) -> Result<f64, ConversionError> {
    let normalized = text.trim().replace(',', ".");
    let value: f64 = normalized.parse().map_err(|_| ConversionError::Malformed {
        text: text.to_string(),
    })?;

    if !value.is_finite() {
        return Err(ConversionError::OutOfRange {
            text: text.to_string(),
        });
    }
    if value < 0.0 {
        return Err(ConversionError::Negative {
            text: text.to_string(),
        });
    }

    let scale = 10f64.powi(decimals as i32);
    let rounded = (value * scale).round() / scale;
    if !rounded.is_finite() {
        return Err(ConversionError::OutOfRange {
            text: text.to_string(),
        });
    }
    // -0.0 collapses to 0.0 so formatting never shows a sign
    Ok(rounded + 0.0)
}

/// Parse an unsigned 32-bit integer (delays, speed set points)
pub fn parse_unsigned(text: &str) -> Result<u32, ConversionError> {
    let trimmed = text.trim();
    if trimmed.starts_with('-') && trimmed.len() > 1 {
        return Err(ConversionError::Negative {
            text: text.to_string(),
        });
    }
    trimmed.parse::<u32>().map_err(|e| match e.kind() {
        std::num::IntErrorKind::PosOverflow => ConversionError::OutOfRange {
            text: text.to_string(),
        },
        _ => ConversionError::Malformed {
            text: text.to_string(),
        },
    })
}

pub fn format_decimal(value: f64, decimals: usize) -> String {
    format!("{:.*}", decimals, value)
}

/// One step of a motion sequence
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct MotionProfileEntry {
    pub speed: f64,
    pub accel_decel: f64,
    pub jerk: f64,
    /// Dwell after the step, milliseconds
    pub delay: u32,
}

impl MotionProfileEntry {
    pub fn new(speed: f64, accel_decel: f64, jerk: f64, delay: u32) -> Self {
        Self {
            speed,
            accel_decel,
            jerk,
            delay,
        }
    }

    /// Replace one field from text. On failure the field keeps its value.
    pub fn update(&mut self, column: Column, text: &str) -> Result<(), ConversionError> {
        match column {
            Column::Speed => self.speed = parse_decimal(text, column.decimals())?,
            Column::AccelDecel => self.accel_decel = parse_decimal(text, column.decimals())?,
            Column::Jerk => self.jerk = parse_decimal(text, column.decimals())?,
            Column::Delay => self.delay = parse_unsigned(text)?,
        }
        Ok(())
    }

    /// Display text of one field
    pub fn get(&self, column: Column) -> String {
        match column {
            Column::Speed => format_decimal(self.speed, column.decimals()),
            Column::AccelDecel => format_decimal(self.accel_decel, column.decimals()),
            Column::Jerk => format_decimal(self.jerk, column.decimals()),
            Column::Delay => self.delay.to_string(),
        }
    }
}

/// Parallel arrays in the layout the drive expects
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SequenceColumns {
    pub speeds: Vec<f64>,
    pub accels: Vec<f64>,
    pub jerks: Vec<f64>,
    pub delays: Vec<u32>,
}

impl SequenceColumns {
    pub fn len(&self) -> usize {
        self.speeds.len()
    }

    pub fn is_empty(&self) -> bool {
        self.speeds.is_empty()
    }
}

/// Ordered list of motion steps; order is playback order
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SequenceTable {
    entries: Vec<MotionProfileEntry>,
}

impl SequenceTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a zero-valued entry and return its row index
    pub fn append(&mut self) -> usize {
        self.entries.push(MotionProfileEntry::default());
        self.entries.len() - 1
    }

    pub fn push(&mut self, entry: MotionProfileEntry) {
        self.entries.push(entry);
    }

    pub fn remove(&mut self, row: usize) -> Result<MotionProfileEntry, ControlError> {
        self.check_row(row)?;
        Ok(self.entries.remove(row))
    }

    /// Edit one cell from text. A failed conversion leaves the cell unchanged.
    pub fn update(&mut self, row: usize, column: usize, text: &str) -> Result<(), ControlError> {
        self.check_row(row)?;
        let column = Column::try_from(column)?;
        self.entries[row].update(column, text)?;
        Ok(())
    }

    pub fn get(&self, row: usize, column: usize) -> Result<String, ControlError> {
        self.check_row(row)?;
        let column = Column::try_from(column)?;
        Ok(self.entries[row].get(column))
    }

    pub fn entry(&self, row: usize) -> Option<&MotionProfileEntry> {
        self.entries.get(row)
    }

    pub fn entries(&self) -> &[MotionProfileEntry] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Split the table into the four parallel arrays sent to the drive
    pub fn columns(&self) -> SequenceColumns {
        let mut cols = SequenceColumns {
            speeds: Vec::with_capacity(self.len()),
            accels: Vec::with_capacity(self.len()),
            jerks: Vec::with_capacity(self.len()),
            delays: Vec::with_capacity(self.len()),
        };
        for entry in &self.entries {
            cols.speeds.push(entry.speed);
            cols.accels.push(entry.accel_decel);
            cols.jerks.push(entry.jerk);
            cols.delays.push(entry.delay);
        }
        cols
    }

    fn check_row(&self, row: usize) -> Result<(), ControlError> {
        if row < self.entries.len() {
            Ok(())
        } else {
            Err(ControlError::RowOutOfRange {
                row,
                len: self.entries.len(),
            })
        }
    }
}

impl From<Vec<MotionProfileEntry>> for SequenceTable {
    fn from(entries: Vec<MotionProfileEntry>) -> Self {
        Self { entries }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_comma_and_dot_decimal() {
        assert_eq!(parse_decimal("12,5", 1), Ok(12.5));
        assert_eq!(parse_decimal("12.5", 1), Ok(12.5));
        assert_eq!(parse_decimal("  200.0 ", 3), Ok(200.0));
    }

    #[test]
    fn test_rounding_to_column_precision() {
        assert_eq!(parse_decimal("12.26", 1), Ok(12.3));
        assert_eq!(parse_decimal("0.12345", 3), Ok(0.123));
        assert_eq!(parse_decimal("7.6", 0), Ok(8.0));
    }

    #[test]
    fn test_malformed_decimal() {
        assert!(matches!(
            parse_decimal("abc", 1),
            Err(ConversionError::Malformed { .. })
        ));
        assert!(matches!(
            parse_decimal("1,234.5", 1),
            Err(ConversionError::Malformed { .. })
        ));
        assert!(matches!(
            parse_decimal("", 1),
            Err(ConversionError::Malformed { .. })
        ));
        assert!(matches!(
            parse_decimal("-1.0", 1),
            Err(ConversionError::Negative { .. })
        ));
        assert!(matches!(
            parse_decimal("1e400", 1),
            Err(ConversionError::OutOfRange { .. })
        ));
        assert!(matches!(
            parse_decimal("NaN", 1),
            Err(ConversionError::OutOfRange { .. })
        ));
    }

    #[test]
    fn test_unsigned() {
        assert_eq!(parse_unsigned("1500"), Ok(1500));
        assert_eq!(parse_unsigned(" 42 "), Ok(42));
        assert!(matches!(
            parse_unsigned("1500.5"),
            Err(ConversionError::Malformed { .. })
        ));
        assert!(matches!(
            parse_unsigned("-3"),
            Err(ConversionError::Negative { .. })
        ));
        assert!(matches!(
            parse_unsigned("4294967296"),
            Err(ConversionError::OutOfRange { .. })
        ));
    }

    #[test]
    fn test_format_per_column() {
        let entry = MotionProfileEntry::new(12.5, 1.0, 0.25, 300);
        assert_eq!(entry.get(Column::Speed), "12.5");
        assert_eq!(entry.get(Column::AccelDecel), "1.000");
        assert_eq!(entry.get(Column::Jerk), "0.250");
        assert_eq!(entry.get(Column::Delay), "300");
    }

    #[test]
    fn test_append_creates_zero_entry() {
        let mut table = SequenceTable::new();
        assert_eq!(table.append(), 0);
        assert_eq!(table.append(), 1);
        assert_eq!(table.entry(1), Some(&MotionProfileEntry::default()));
    }

    #[test]
    fn test_update_comma_input() {
        let mut table = SequenceTable::new();
        table.append();
        table.append();
        table.update(0, 0, "12,5").unwrap();
        assert_eq!(table.entry(0).unwrap().speed, 12.5);
        assert_eq!(table.entry(1).unwrap().speed, 0.0);
    }

    #[test]
    fn test_failed_update_keeps_prior_value() {
        let mut table = SequenceTable::new();
        table.append();
        table.update(0, 3, "250").unwrap();
        table.update(0, 1, "3.5").unwrap();

        let err = table.update(0, 3, "soon").unwrap_err();
        assert!(matches!(err, ControlError::Conversion(_)));
        let err = table.update(0, 1, "-2").unwrap_err();
        assert!(matches!(err, ControlError::Conversion(_)));

        let entry = table.entry(0).unwrap();
        assert_eq!(entry.delay, 250);
        assert_eq!(entry.accel_decel, 3.5);
    }

    #[test]
    fn test_update_bad_indices() {
        let mut table = SequenceTable::new();
        table.append();
        assert_eq!(
            table.update(1, 0, "1"),
            Err(ControlError::RowOutOfRange { row: 1, len: 1 })
        );
        assert_eq!(table.update(0, 4, "1"), Err(ControlError::UnknownColumn(4)));
    }

    #[test]
    fn test_remove_by_index() {
        let mut table = SequenceTable::from(vec![
            MotionProfileEntry::new(1.0, 0.0, 0.0, 0),
            MotionProfileEntry::new(2.0, 0.0, 0.0, 0),
            MotionProfileEntry::new(3.0, 0.0, 0.0, 0),
        ]);
        let removed = table.remove(1).unwrap();
        assert_eq!(removed.speed, 2.0);
        let speeds: Vec<f64> = table.entries().iter().map(|e| e.speed).collect();
        assert_eq!(speeds, vec![1.0, 3.0]);
        assert!(table.remove(5).is_err());
    }

    #[test]
    fn test_columns_preserve_order() {
        let table = SequenceTable::from(vec![
            MotionProfileEntry::new(100.0, 10.0, 1.0, 500),
            MotionProfileEntry::new(200.0, 20.0, 2.0, 0),
        ]);
        let cols = table.columns();
        assert_eq!(cols.speeds, vec![100.0, 200.0]);
        assert_eq!(cols.accels, vec![10.0, 20.0]);
        assert_eq!(cols.jerks, vec![1.0, 2.0]);
        assert_eq!(cols.delays, vec![500, 0]);
    }

    proptest! {
        #[test]
        fn prop_decimal_round_trip(
            int in 0u32..1_000_000,
            frac in 0u32..100_000,
            comma in any::<bool>(),
            column in 0usize..3,
        ) {
            let sep = if comma { ',' } else { '.' };
            let text = format!("{}{}{:05}", int, sep, frac);
            let decimals = Column::try_from(column).unwrap().decimals();

            let first = parse_decimal(&text, decimals).unwrap();
            let again = parse_decimal(&format_decimal(first, decimals), decimals).unwrap();
            prop_assert_eq!(first, again);
        }

        #[test]
        fn prop_delay_round_trip(delay in any::<u32>()) {
            let first = parse_unsigned(&delay.to_string()).unwrap();
            prop_assert_eq!(parse_unsigned(&first.to_string()).unwrap(), first);
        }

        #[test]
        fn prop_malformed_keeps_value(garbage in "[a-zA-Z#%]{1,8}", column in 0usize..4) {
            let mut entry = MotionProfileEntry::new(1.5, 2.25, 3.125, 7);
            let before = entry;
            let col = Column::try_from(column).unwrap();
            prop_assert!(entry.update(col, &garbage).is_err());
            prop_assert_eq!(entry, before);
        }
    }
}
