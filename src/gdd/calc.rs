//! Daily contribution calculator.
//!
//! Pure functions: one day's min/max temperature reading plus the parameter
//! set effective on that date yields a single non-negative degree-day
//! contribution. Unit conversion is explicit at this boundary; a reading is
//! always converted into the model's declared unit before subtraction.

use crate::models::TempUnit;

/// Fahrenheit to Celsius, standard linear conversion.
pub fn f_to_c(f: f64) -> f64 {
    (f - 32.0) * 5.0 / 9.0
}

/// Celsius to Fahrenheit, standard linear conversion.
pub fn c_to_f(c: f64) -> f64 {
    c * 9.0 / 5.0 + 32.0
}

/// Convert a temperature between units. Identity when units match.
pub fn convert(temp: f64, from: TempUnit, to: TempUnit) -> f64 {
    match (from, to) {
        (TempUnit::C, TempUnit::F) => c_to_f(temp),
        (TempUnit::F, TempUnit::C) => f_to_c(temp),
        _ => temp,
    }
}

/// A single day's min/max reading in a known unit.
#[derive(Debug, Clone, Copy)]
pub struct Reading {
    pub tmin: f64,
    pub tmax: f64,
    pub unit: TempUnit,
}

impl Reading {
    pub fn new(tmin: f64, tmax: f64, unit: TempUnit) -> Self {
        Self { tmin, tmax, unit }
    }

    /// Simple min/max average in the requested unit.
    pub fn average_in(&self, unit: TempUnit) -> f64 {
        let avg = (self.tmin + self.tmax) / 2.0;
        convert(avg, self.unit, unit)
    }
}

/// Daily degree-day contribution: `max(0, avg(tmin, tmax) - base_temp)`,
/// with the reading converted into `model_unit` first. `base_temp` is
/// already in the model's unit.
pub fn daily_contribution(reading: Reading, base_temp: f64, model_unit: TempUnit) -> f64 {
    let avg = reading.average_in(model_unit);
    (avg - base_temp).max(0.0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unit_conversions_at_fixed_points() {
        assert_eq!(f_to_c(32.0), 0.0);
        assert_eq!(f_to_c(212.0), 100.0);
        assert_eq!(c_to_f(0.0), 32.0);
        assert_eq!(c_to_f(100.0), 212.0);
        assert_eq!(convert(50.0, TempUnit::F, TempUnit::F), 50.0);
    }

    #[test]
    fn contribution_is_average_minus_base() {
        // 50F/70F averages to 60F; base 50F -> 10 GDD.
        let reading = Reading::new(50.0, 70.0, TempUnit::F);
        assert_eq!(daily_contribution(reading, 50.0, TempUnit::F), 10.0);
    }

    #[test]
    fn contribution_clamps_at_zero() {
        let reading = Reading::new(20.0, 40.0, TempUnit::F);
        assert_eq!(daily_contribution(reading, 50.0, TempUnit::F), 0.0);
    }

    #[test]
    fn cross_unit_reading_is_converted_before_subtraction() {
        // 10C/20C averages to 15C = 59F; base 50F -> 9 GDD.
        let reading = Reading::new(10.0, 20.0, TempUnit::C);
        let gdd = daily_contribution(reading, 50.0, TempUnit::F);
        assert!((gdd - 9.0).abs() < 1e-9);

        // Same reading against a Celsius model with base 10C -> 5 GDD.
        let gdd = daily_contribution(reading, 10.0, TempUnit::C);
        assert!((gdd - 5.0).abs() < 1e-9);
    }
}
