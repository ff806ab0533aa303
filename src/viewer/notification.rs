use serde::Serialize;
use serde_json::Value;

/// Messages sent to the embedder. Serialized with the kind under `"t"`.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "t", rename_all = "lowercase")]
pub enum Notification {
    Done {
        a: String,
    },
    Error {
        a: String,
        content: String,
    },
    Nav {
        first: bool,
        last: bool,
        epage: f64,
        #[serde(rename = "epageCount")]
        epage_count: f64,
        #[serde(skip_serializing_if = "Option::is_none")]
        cfi: Option<String>,
    },
    Loaded {
        #[serde(skip_serializing_if = "Option::is_none")]
        metadata: Option<Value>,
    },
    Hyperlink {
        href: String,
        internal: bool,
    },
}

impl Notification {
    /// The JSON message for the embedder, tagged with the viewer instance.
    pub fn to_message(&self, instance_id: &str) -> Result<Value, serde_json::Error> {
        let mut message = serde_json::to_value(self)?;
        if let Value::Object(map) = &mut message {
            map.insert("i".into(), Value::from(instance_id));
        }
        Ok(message)
    }
}
