use serde::Serialize;
use tokio::sync::mpsc;
use tracing::trace;

/// Key/value update for UI consumers, optionally scoped to a loadpoint.
#[derive(Debug, Clone, Serialize)]
pub struct Param {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub loadpoint: Option<usize>,
    pub key: String,
    pub val: serde_json::Value,
}

/// Cloneable handle for emitting [`Param`] values. Loadpoint-scoped handles
/// carry their index so consumers can route updates without extra piping.
#[derive(Debug, Clone, Default)]
pub struct Publisher {
    tx: Option<mpsc::UnboundedSender<Param>>,
    loadpoint: Option<usize>,
}

impl Publisher {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<Param>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            Self {
                tx: Some(tx),
                loadpoint: None,
            },
            rx,
        )
    }

    /// A publisher that drops everything. Test helper.
    pub fn disabled() -> Self {
        Self::default()
    }

    pub fn for_loadpoint(&self, id: usize) -> Self {
        Self {
            tx: self.tx.clone(),
            loadpoint: Some(id),
        }
    }

    pub fn publish(&self, key: &str, val: impl Serialize) {
        let Some(tx) = &self.tx else { return };
        let val = match serde_json::to_value(val) {
            Ok(val) => val,
            Err(err) => {
                trace!(key, error = %err, "unserializable publish value");
                return;
            }
        };
        // receiver gone means no UI attached, keep running
        let _ = tx.send(Param {
            loadpoint: self.loadpoint,
            key: key.to_string(),
            val,
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn loadpoint_scope_is_attached() {
        let (publisher, mut rx) = Publisher::new();
        publisher.publish("gridPower", 42.0);
        publisher.for_loadpoint(1).publish("mode", "pv");

        let p = rx.recv().await.unwrap();
        assert_eq!(p.key, "gridPower");
        assert_eq!(p.loadpoint, None);

        let p = rx.recv().await.unwrap();
        assert_eq!(p.key, "mode");
        assert_eq!(p.loadpoint, Some(1));
        assert_eq!(p.val, serde_json::json!("pv"));
    }

    #[test]
    fn disabled_publisher_is_a_no_op() {
        Publisher::disabled().publish("anything", 1);
    }
}
