use core::cmp::Ordering;

use serde::{Deserialize, Serialize};

pub const MAX_BREAKPOINTS: usize = 5;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Breakpoint {
    #[serde(rename = "spread", alias = "threshold")]
    pub threshold: f32,
    pub power: u8,
}

impl Breakpoint {
    pub fn new(threshold: f32, power: u8) -> Self {
        Self {
            threshold,
            power: power.min(100),
        }
    }
}

/// Ordered set of breakpoints, highest threshold first.
#[derive(Debug, Clone, PartialEq)]
pub struct BreakpointTable {
    entries: heapless::Vec<Breakpoint, MAX_BREAKPOINTS>,
}

impl Default for BreakpointTable {
    fn default() -> Self {
        let mut table = Self::empty();
        table.replace(&[
            Breakpoint::new(6.0, 20),
            Breakpoint::new(4.0, 40),
            Breakpoint::new(2.5, 60),
            Breakpoint::new(1.5, 80),
            Breakpoint::new(0.5, 100),
        ]);
        table
    }
}

impl BreakpointTable {
    pub fn empty() -> Self {
        Self {
            entries: heapless::Vec::new(),
        }
    }

    pub fn entries(&self) -> &[Breakpoint] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn replace(&mut self, rows: &[Breakpoint]) {
        self.entries.clear();
        for row in rows.iter().filter(|row| row.threshold.is_finite()) {
            if self
                .entries
                .push(Breakpoint::new(row.threshold, row.power))
                .is_err()
            {
                break;
            }
        }
        self.entries.sort_by(|a, b| {
            b.threshold
                .partial_cmp(&a.threshold)
                .unwrap_or(Ordering::Equal)
        });
    }

    // first row above the margin wins; 0 once every threshold is cleared
    pub fn lookup(&self, margin: f32) -> u8 {
        self.entries
            .iter()
            .find(|row| row.threshold > margin)
            .map(|row| row.power)
            .unwrap_or(0)
    }

    pub fn to_record(&self) -> TableRecord {
        TableRecord {
            count: self.entries.len() as i64,
            entries: self.entries.to_vec(),
        }
    }

    pub fn from_record(record: &TableRecord) -> Self {
        let count = record.count.clamp(0, MAX_BREAKPOINTS as i64) as usize;
        let count = count.min(record.entries.len());
        let mut table = Self::empty();
        table.replace(&record.entries[..count]);
        table
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TableRecord {
    pub count: i64,
    pub entries: Vec<Breakpoint>,
}

impl Default for TableRecord {
    fn default() -> Self {
        BreakpointTable::default().to_record()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn thresholds(table: &BreakpointTable) -> Vec<f32> {
        table.entries().iter().map(|row| row.threshold).collect()
    }

    #[test]
    fn replace_sorts_descending() {
        let mut table = BreakpointTable::empty();
        table.replace(&[
            Breakpoint::new(1.0, 90),
            Breakpoint::new(5.0, 10),
            Breakpoint::new(3.0, 50),
        ]);

        assert_eq!(thresholds(&table), vec![5.0, 3.0, 1.0]);
        assert_eq!(table.entries()[0].power, 10);
    }

    #[test]
    fn replace_keeps_input_order_for_equal_thresholds() {
        let mut table = BreakpointTable::empty();
        table.replace(&[
            Breakpoint::new(2.0, 30),
            Breakpoint::new(4.0, 10),
            Breakpoint::new(2.0, 70),
        ]);

        let powers: Vec<u8> = table.entries().iter().map(|row| row.power).collect();
        assert_eq!(powers, vec![10, 30, 70]);
    }

    #[test]
    fn replace_truncates_before_sorting() {
        let rows: Vec<Breakpoint> = (0..8)
            .map(|i| Breakpoint::new(i as f32, (i * 10) as u8))
            .collect();
        let mut table = BreakpointTable::empty();
        table.replace(&rows);

        assert_eq!(table.len(), MAX_BREAKPOINTS);
        assert_eq!(thresholds(&table), vec![4.0, 3.0, 2.0, 1.0, 0.0]);
    }

    #[test]
    fn replace_clamps_power_and_skips_nan() {
        let mut table = BreakpointTable::empty();
        table.replace(&[
            Breakpoint {
                threshold: 2.0,
                power: 250,
            },
            Breakpoint {
                threshold: f32::NAN,
                power: 10,
            },
        ]);

        assert_eq!(table.entries(), &[Breakpoint::new(2.0, 100)]);
    }

    #[test]
    fn lookup_returns_first_row_above_margin() {
        let mut table = BreakpointTable::empty();
        table.replace(&[Breakpoint::new(5.0, 10), Breakpoint::new(2.0, 60)]);

        assert_eq!(table.lookup(1.0), 10);
        assert_eq!(table.lookup(4.9), 10);
        assert_eq!(table.lookup(5.0), 0);
        assert_eq!(table.lookup(12.0), 0);
    }

    #[test]
    fn lookup_on_empty_table_is_zero() {
        assert_eq!(BreakpointTable::empty().lookup(-3.0), 0);
    }

    #[test]
    fn record_round_trip_preserves_rows() {
        let table = BreakpointTable::default();
        let record = table.to_record();
        assert_eq!(record.count, MAX_BREAKPOINTS as i64);
        assert_eq!(BreakpointTable::from_record(&record), table);
    }

    #[test]
    fn record_count_out_of_range_is_clamped() {
        let rows = vec![Breakpoint::new(3.0, 40), Breakpoint::new(1.0, 80)];

        let oversized = TableRecord {
            count: 42,
            entries: rows.clone(),
        };
        assert_eq!(BreakpointTable::from_record(&oversized).len(), 2);

        let negative = TableRecord {
            count: -7,
            entries: rows.clone(),
        };
        assert!(BreakpointTable::from_record(&negative).is_empty());

        let partial = TableRecord {
            count: 1,
            entries: rows,
        };
        assert_eq!(
            BreakpointTable::from_record(&partial).entries(),
            &[Breakpoint::new(3.0, 40)]
        );
    }
}
