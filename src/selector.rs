//! Device/SIM selection for outbound SMS.
//!
//! [`select_device`] is pure: it looks only at the device snapshot it is
//! given and has no side effects, so a failed selection leaves nothing behind.

use crate::config::SelectorConfig;
use crate::models::{DeviceRecord, SimRecord};

/// Dialing-code prefixes to country codes. Matching is first-hit in this
/// order, not longest-prefix.
pub const DIALING_CODES: &[(&str, &str)] = &[
    ("+90", "TR"),
    ("+1", "US"),
    ("+44", "UK"),
    ("+49", "DE"),
    ("+33", "FR"),
];

/// Characters per SMS unit.
pub const SMS_UNIT_LEN: usize = 160;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SelectionError {
    #[error("no eligible device (country: {}, operator: {})", .country.as_deref().unwrap_or("any"), .operator.as_deref().unwrap_or("any"))]
    NoEligibleDevice {
        country: Option<String>,
        operator: Option<String>,
    },
}

/// Country derived from a `+<dialing code>` prefix.
pub fn country_for_number(number: &str) -> Option<&'static str> {
    if !number.starts_with('+') {
        return None;
    }
    DIALING_CODES
        .iter()
        .find(|(code, _)| number.starts_with(code))
        .map(|(_, country)| *country)
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SelectionRequest<'a> {
    pub destination: &'a str,
    /// Site country filter. Derived from `destination` when absent.
    pub country: Option<&'a str>,
    /// Device-group operator filter.
    pub operator: Option<&'a str>,
}

#[derive(Debug, Clone, Copy)]
pub struct Selection<'a> {
    pub device: &'a DeviceRecord,
    pub sim: &'a SimRecord,
}

/// Pick the best `(device, sim)` pair.
///
/// Eligible devices are active, available, operator-online and at or above
/// the battery floor, narrowed by country and operator when known. They are
/// ranked by battery, then signal, then most recent `last_seen`, and the first
/// SIM in stored order that is active, enabled and has signal wins.
pub fn select_device<'a>(
    devices: &'a [DeviceRecord],
    request: &SelectionRequest<'_>,
    config: &SelectorConfig,
) -> Result<Selection<'a>, SelectionError> {
    let country = request
        .country
        .filter(|c| !c.is_empty())
        .or_else(|| country_for_number(request.destination));
    let operator = request.operator.filter(|o| !o.is_empty());

    let mut eligible: Vec<&DeviceRecord> = devices
        .iter()
        .filter(|d| d.is_ready_for_sms(config.min_battery))
        // A device with no site or group is only excluded by an active filter.
        .filter(|d| country.map_or(true, |c| d.country() == Some(c)))
        .filter(|d| operator.map_or(true, |o| d.operator() == Some(o)))
        .collect();

    eligible.sort_by(|a, b| {
        b.battery_level
            .cmp(&a.battery_level)
            .then_with(|| b.signal_strength.cmp(&a.signal_strength))
            .then_with(|| b.last_seen.cmp(&a.last_seen))
    });

    eligible
        .into_iter()
        .find_map(|device| {
            device
                .sims
                .iter()
                .find(|sim| sim.can_send())
                .map(|sim| Selection { device, sim })
        })
        .ok_or_else(|| SelectionError::NoEligibleDevice {
            country: country.map(str::to_string),
            operator: operator.map(str::to_string),
        })
}

/// Number of SMS units a message occupies (by byte length).
pub fn message_units(message: &str) -> usize {
    message.len().div_ceil(SMS_UNIT_LEN)
}

/// Informational cost estimate. Destinations outside the home dialing code
/// pay the international multiplier.
pub fn estimate_cost(destination: &str, message: &str, config: &SelectorConfig) -> f64 {
    let mut unit_cost = config.base_unit_cost;
    if destination.starts_with('+') && !destination.starts_with(&config.home_dialing_code) {
        unit_cost *= config.international_multiplier;
    }
    #[allow(clippy::cast_precision_loss)]
    let units = message_units(message) as f64;
    units * unit_cost
}
