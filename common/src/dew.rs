use crate::table::BreakpointTable;

pub const MAGNUS_A: f32 = 17.62;
pub const MAGNUS_B: f32 = 243.12;

pub const DEFAULT_FALLBACK_POWER_PERCENT: u8 = 50;

pub fn dew_point_c(temperature_c: Option<f32>, humidity: Option<f32>) -> Option<f32> {
    let t = temperature_c.filter(|value| value.is_finite())?;
    let rh = humidity.filter(|value| value.is_finite())?;
    if rh <= 0.0 {
        return None;
    }

    let gamma = (MAGNUS_A * t) / (MAGNUS_B + t) + (rh / 100.0).ln();
    let dew_point = (MAGNUS_B * gamma) / (MAGNUS_A - gamma);
    dew_point.is_finite().then_some(dew_point)
}

pub fn margin_c(temperature_c: Option<f32>, dew_point_c: Option<f32>) -> Option<f32> {
    let t = temperature_c.filter(|value| value.is_finite())?;
    let td = dew_point_c?;
    Some(t - td)
}

#[derive(Debug, Clone, Copy)]
pub struct PowerRequest<'a> {
    pub margin_c: Option<f32>,
    pub heater_enabled: bool,
    pub manual_override: Option<u8>,
    pub fallback_percent: u8,
    pub table: &'a BreakpointTable,
}

/// Heater power in percent, always within 0..=100.
pub fn select_power(request: &PowerRequest<'_>) -> u8 {
    if !request.heater_enabled {
        return 0;
    }
    if let Some(percent) = request.manual_override {
        return percent.min(100);
    }
    match request.margin_c {
        None => request.fallback_percent.min(100),
        Some(margin) => request.table.lookup(margin),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::table::{Breakpoint, MAX_BREAKPOINTS};

    fn table(rows: &[(f32, u8)]) -> BreakpointTable {
        let rows: Vec<Breakpoint> = rows
            .iter()
            .map(|(threshold, power)| Breakpoint::new(*threshold, *power))
            .collect();
        let mut table = BreakpointTable::empty();
        table.replace(&rows);
        table
    }

    fn auto(margin: Option<f32>, table: &BreakpointTable) -> u8 {
        select_power(&PowerRequest {
            margin_c: margin,
            heater_enabled: true,
            manual_override: None,
            fallback_percent: DEFAULT_FALLBACK_POWER_PERCENT,
            table,
        })
    }

    #[test]
    fn margin_at_twenty_degrees_half_humidity() {
        let td = dew_point_c(Some(20.0), Some(50.0)).unwrap();
        let margin = margin_c(Some(20.0), Some(td)).unwrap();
        // Td ~9.26 °C, so the spread sits just under 11 °C.
        assert!((9.0..=10.0).contains(&td), "dew point was {td}");
        assert!(margin > 0.0);
        assert!((10.0..=11.5).contains(&margin), "margin was {margin}");
    }

    #[test]
    fn saturated_air_has_zero_margin() {
        let td = dew_point_c(Some(12.5), Some(100.0)).unwrap();
        let margin = margin_c(Some(12.5), Some(td)).unwrap();
        assert!(margin.abs() < 0.01, "margin was {margin}");
    }

    #[test]
    fn invalid_inputs_yield_no_dew_point() {
        assert_eq!(dew_point_c(Some(20.0), Some(0.0)), None);
        assert_eq!(dew_point_c(Some(20.0), Some(-5.0)), None);
        assert_eq!(dew_point_c(None, Some(50.0)), None);
        assert_eq!(dew_point_c(Some(f32::NAN), Some(50.0)), None);
        assert_eq!(dew_point_c(Some(20.0), None), None);
        assert_eq!(margin_c(Some(20.0), None), None);
        assert_eq!(margin_c(None, Some(5.0)), None);
    }

    #[test]
    fn unknown_margin_uses_fallback_not_table() {
        let rows = table(&[(50.0, 7)]);
        let power = select_power(&PowerRequest {
            margin_c: None,
            heater_enabled: true,
            manual_override: None,
            fallback_percent: 35,
            table: &rows,
        });
        assert_eq!(power, 35);
        assert_eq!(auto(None, &BreakpointTable::empty()), DEFAULT_FALLBACK_POWER_PERCENT);
    }

    #[test]
    fn disabled_heater_forces_zero() {
        let rows = table(&[(50.0, 100)]);
        for manual_override in [None, Some(80)] {
            for margin in [None, Some(-2.0), Some(3.0)] {
                let power = select_power(&PowerRequest {
                    margin_c: margin,
                    heater_enabled: false,
                    manual_override,
                    fallback_percent: 60,
                    table: &rows,
                });
                assert_eq!(power, 0);
            }
        }
    }

    #[test]
    fn manual_override_bypasses_table_and_sensor_state() {
        let rows = table(&[(50.0, 100)]);
        for margin in [None, Some(-1.0), Some(99.0)] {
            let power = select_power(&PowerRequest {
                margin_c: margin,
                heater_enabled: true,
                manual_override: Some(17),
                fallback_percent: 60,
                table: &rows,
            });
            assert_eq!(power, 17);
        }
    }

    #[test]
    fn table_scan_matches_first_row_above_margin_for_every_size() {
        let all_rows = [(8.0, 15), (5.0, 35), (3.0, 55), (1.5, 75), (0.5, 95)];

        for size in 0..=MAX_BREAKPOINTS {
            let rows = table(&all_rows[..size]);
            let mut samples = vec![-10.0_f32, 100.0];
            for (threshold, _) in &all_rows[..size] {
                samples.extend([threshold - 0.25, *threshold, threshold + 0.25]);
            }

            for margin in samples {
                let expected = rows
                    .entries()
                    .iter()
                    .find(|row| row.threshold > margin)
                    .map(|row| row.power)
                    .unwrap_or(0);
                assert_eq!(auto(Some(margin), &rows), expected, "size {size} margin {margin}");
            }
        }
    }

    #[test]
    fn margin_above_every_threshold_idles_heater() {
        let rows = table(&[(4.0, 40), (2.0, 90)]);
        assert_eq!(auto(Some(4.0), &rows), 0);
        assert_eq!(auto(Some(30.0), &rows), 0);
        assert_eq!(auto(Some(1.0), &rows), 40);
    }
}
