use serde::{Deserialize, Serialize};

/// Inbound message from a client. Only `ack_ts` is recognized; every other
/// field, and any frame that is not a JSON object, is ignored.
#[derive(Debug, Clone, Deserialize)]
pub struct ClientMessage {
    #[serde(default)]
    pub ack_ts: Option<f64>,
}

/// End-to-end latency percentiles embedded in the summary record.
#[derive(Debug, Clone, Serialize)]
pub struct LatencySummary {
    pub p50: f64,
    pub p95: f64,
}

/// Global metrics record emitted on every metrics tick.
#[derive(Debug, Clone, Serialize)]
pub struct SummaryRecord {
    pub r#type: String,
    pub clients: usize,
    pub pub_rate: f64,
    pub e2e_latency: LatencySummary,
    pub disconnects_total: u64,
}

/// Per-client metrics record emitted after the summary.
#[derive(Debug, Clone, Serialize)]
pub struct ClientRecord {
    pub r#type: String,
    pub client_id: u64,
    pub peer: String,
    pub queue_len: usize,
    pub drops_total: u64,
    pub send_latency_ms: f64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ack_parses_with_extra_fields() {
        let message: ClientMessage =
            serde_json::from_str(r#"{"ack_ts": 1700000000.5, "noise": [1, 2]}"#).unwrap();
        assert_eq!(message.ack_ts, Some(1700000000.5));
    }

    #[test]
    fn non_ack_object_parses_to_none() {
        let message: ClientMessage = serde_json::from_str(r#"{"hello": "world"}"#).unwrap();
        assert_eq!(message.ack_ts, None);
    }

    #[test]
    fn non_object_frames_fail_to_parse() {
        assert!(serde_json::from_str::<ClientMessage>("just text").is_err());
        assert!(serde_json::from_str::<ClientMessage>("[1,2,3]").is_err());
    }

    #[test]
    fn summary_record_carries_its_type_tag() {
        let record = SummaryRecord {
            r#type: "summary".to_string(),
            clients: 2,
            pub_rate: 100.0,
            e2e_latency: LatencySummary { p50: 1.5, p95: 9.0 },
            disconnects_total: 3,
        };
        let value: serde_json::Value =
            serde_json::from_str(&serde_json::to_string(&record).unwrap()).unwrap();
        assert_eq!(value["type"], "summary");
        assert_eq!(value["e2e_latency"]["p95"], 9.0);
        assert_eq!(value["disconnects_total"], 3);
    }
}
