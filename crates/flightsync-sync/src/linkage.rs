//! Flight-report cross-reference resolution, shared by the flight-report sync
//! (inline) and the backfill job.

use flightsync_core::fields;
use flightsync_storage::{StoreResult, SyncStore};
use serde_json::{Map as JsonMap, Value as JsonValue};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Resolution {
    pub pilot_id: Option<Uuid>,
    pub route_id: Option<Uuid>,
}

impl Resolution {
    pub fn is_complete(&self) -> bool {
        self.pilot_id.is_some() && self.route_id.is_some()
    }
}

pub struct ReportLinker<'a> {
    store: &'a dyn SyncStore,
    tenant_id: Uuid,
    callsign_prefix: &'a str,
}

impl<'a> ReportLinker<'a> {
    pub fn new(store: &'a dyn SyncStore, tenant_id: Uuid, callsign_prefix: &'a str) -> Self {
        Self {
            store,
            tenant_id,
            callsign_prefix,
        }
    }

    pub async fn resolve(&self, report: &JsonMap<String, JsonValue>) -> StoreResult<Resolution> {
        let mut resolution = Resolution::default();

        if let Some(callsign) = text_field(report, fields::PILOT_CALLSIGN) {
            for candidate in pilot_candidates(self.callsign_prefix, callsign) {
                if let Some(id) = self
                    .store
                    .find_pilot_by_callsign(self.tenant_id, &candidate)
                    .await?
                {
                    resolution.pilot_id = Some(id);
                    break;
                }
            }
        }

        if let Some((origin, destination)) = route_endpoints(report) {
            resolution.route_id = self
                .store
                .find_route(self.tenant_id, &origin, &destination)
                .await?;
        }

        Ok(resolution)
    }
}

/// Callsigns to try against synced pilots: prefix + callsign first, then the
/// callsign as written.
pub fn pilot_candidates(prefix: &str, callsign: &str) -> Vec<String> {
    let callsign = callsign.trim();
    let prefix = prefix.trim();
    if callsign.is_empty() {
        return Vec::new();
    }
    let already_prefixed = !prefix.is_empty()
        && callsign
            .get(..prefix.len())
            .is_some_and(|head| head.eq_ignore_ascii_case(prefix));
    if prefix.is_empty() || already_prefixed {
        vec![callsign.to_string()]
    } else {
        vec![format!("{prefix}{callsign}"), callsign.to_string()]
    }
}

/// Origin/destination from the report's route string, else its origin and
/// destination fields.
pub fn route_endpoints(report: &JsonMap<String, JsonValue>) -> Option<(String, String)> {
    text_field(report, fields::ROUTE)
        .and_then(parse_route)
        .or_else(|| {
            let origin = text_field(report, fields::ORIGIN)?;
            let destination = text_field(report, fields::DESTINATION)?;
            Some((origin.to_ascii_uppercase(), destination.to_ascii_uppercase()))
        })
}

/// Parse "KJFK-EGLL", "KJFK → EGLL", "KJFK/EGLL" or "KJFK to EGLL".
pub fn parse_route(route: &str) -> Option<(String, String)> {
    let tokens: Vec<String> = route
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { ' ' })
        .collect::<String>()
        .split_whitespace()
        .filter(|t| !t.eq_ignore_ascii_case("to"))
        .map(str::to_ascii_uppercase)
        .collect();
    match tokens.as_slice() {
        [origin, destination] => Some((origin.clone(), destination.clone())),
        _ => None,
    }
}

fn text_field<'m>(fields: &'m JsonMap<String, JsonValue>, name: &str) -> Option<&'m str> {
    fields
        .get(name)
        .and_then(JsonValue::as_str)
        .map(str::trim)
        .filter(|s| !s.is_empty())
}
