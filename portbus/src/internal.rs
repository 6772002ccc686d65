//! Names and payload shapes for the bus's own `ipc_`-prefixed events.
//!
//! These are dispatched by the router before user listeners ever see them; user code
//! never receives an `ipc_` event through [`Peer::on`](crate::peer::Peer::on).

/// Sent by a worker to the master whenever its label set changes.
pub const EVENT_SET_LABELS: &str = "ipc_setlabels";

/// Sent by a worker to ask the master how many connections currently advertise a
/// label, before fanning a `request_many` out to them. Answered with
/// `{"count": <n>}`.
pub const EVENT_QUERY_LABEL: &str = "ipc_query_label";

#[inline]
pub fn is_internal(event: &str) -> bool {
    event.starts_with("ipc_")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reserved_prefix_is_detected() {
        assert!(is_internal(EVENT_SET_LABELS));
        assert!(is_internal(EVENT_QUERY_LABEL));
        assert!(!is_internal("render_done"));
    }
}
