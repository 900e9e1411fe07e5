use super::key_store::{normalize_key_path, KeyChild, KeyNode, KeyStore, KeyStoreError};
use crate::config::KeyStoreSettings;
use serde::Deserialize;
use std::time::Duration;

/// etcd v2 keys API client.
pub struct EtcdKeyStore {
    endpoint: String,
    agent: ureq::Agent,
}

#[derive(Debug, Clone, Deserialize)]
struct EtcdEnvelope {
    node: EtcdNode,
}

#[derive(Debug, Clone, Deserialize)]
struct EtcdNode {
    #[serde(default)]
    key: String,
    #[serde(default)]
    value: Option<String>,
    #[serde(default)]
    dir: bool,
    #[serde(default)]
    nodes: Vec<EtcdNode>,
}

#[derive(Debug, Clone, Deserialize)]
struct EtcdErrorBody {
    #[serde(default)]
    message: String,
    #[serde(default)]
    cause: Option<String>,
}

impl EtcdKeyStore {
    pub fn new(settings: &KeyStoreSettings) -> Self {
        let agent = ureq::AgentBuilder::new()
            .timeout(Duration::from_secs(settings.timeout_secs))
            .build();
        Self {
            endpoint: settings.endpoint.trim_end_matches('/').to_string(),
            agent,
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}/v2/keys{}", self.endpoint, encode_key_path(path))
    }
}

fn encode_key_path(path: &str) -> String {
    let normalized = normalize_key_path(path);
    if normalized == "/" {
        return normalized;
    }
    normalized
        .split('/')
        .map(|segment| urlencoding::encode(segment).into_owned())
        .collect::<Vec<_>>()
        .join("/")
}

fn node_from_response(path: &str, body: &str) -> Result<KeyNode, KeyStoreError> {
    let envelope: EtcdEnvelope =
        serde_json::from_str(body).map_err(|err| KeyStoreError::Response {
            path: path.to_string(),
            message: err.to_string(),
        })?;
    let node = envelope.node;
    if !node.dir {
        return Ok(KeyNode::Leaf(node.value.unwrap_or_default()));
    }
    let mut children = node
        .nodes
        .into_iter()
        .map(|child| KeyChild {
            key: child.key,
            value: if child.dir { None } else { child.value },
        })
        .collect::<Vec<_>>();
    children.sort_by(|a, b| a.key.cmp(&b.key));
    Ok(KeyNode::Dir(children))
}

fn rejection(path: &str, code: u16, response: ureq::Response) -> KeyStoreError {
    let message = response
        .into_string()
        .ok()
        .and_then(|body| serde_json::from_str::<EtcdErrorBody>(&body).ok())
        .map(|body| match body.cause {
            Some(cause) => format!("{} ({cause})", body.message),
            None => body.message,
        })
        .unwrap_or_default();
    KeyStoreError::Rejected {
        path: path.to_string(),
        message: format!("http {code}: {message}"),
    }
}

fn request_failure(path: &str, err: ureq::Error) -> KeyStoreError {
    match err {
        ureq::Error::Status(code, response) => rejection(path, code, response),
        other => KeyStoreError::Request {
            path: path.to_string(),
            message: other.to_string(),
        },
    }
}

impl KeyStore for EtcdKeyStore {
    fn exists(&self, path: &str) -> Result<bool, KeyStoreError> {
        Ok(self.read(path)?.is_some())
    }

    fn read(&self, path: &str) -> Result<Option<KeyNode>, KeyStoreError> {
        let response = match self.agent.get(&self.url(path)).call() {
            Ok(response) => response,
            Err(ureq::Error::Status(404, _)) => return Ok(None),
            Err(err) => return Err(request_failure(path, err)),
        };
        let body = response
            .into_string()
            .map_err(|err| KeyStoreError::Response {
                path: path.to_string(),
                message: err.to_string(),
            })?;
        node_from_response(path, &body).map(Some)
    }

    fn write(&self, path: &str, value: &str) -> Result<(), KeyStoreError> {
        self.agent
            .put(&self.url(path))
            .send_form(&[("value", value)])
            .map_err(|err| request_failure(path, err))?;
        Ok(())
    }

    fn delete(&self, path: &str, recursive: bool) -> Result<(), KeyStoreError> {
        let mut request = self.agent.delete(&self.url(path));
        if recursive {
            request = request.query("recursive", "true");
        }
        request.call().map_err(|err| request_failure(path, err))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn leaf_responses_decode_to_values() {
        let body = r#"{"action":"get","node":{"key":"/prod/web/1.0/app.cfg/name","value":"world","modifiedIndex":7}}"#;
        let node = node_from_response("/prod/web/1.0/app.cfg/name", body).expect("node");
        assert_eq!(node, KeyNode::Leaf("world".to_string()));
    }

    #[test]
    fn directory_responses_list_children_sorted() {
        let body = r#"{"action":"get","node":{"key":"/a","dir":true,"nodes":[
            {"key":"/a/z","value":"2"},
            {"key":"/a/sub","dir":true},
            {"key":"/a/b","value":"1"}
        ]}}"#;
        let KeyNode::Dir(children) = node_from_response("/a", body).expect("node") else {
            panic!("expected directory");
        };
        let keys = children.iter().map(|c| c.key.as_str()).collect::<Vec<_>>();
        assert_eq!(keys, vec!["/a/b", "/a/sub", "/a/z"]);
        assert_eq!(children[1].value, None);
    }

    #[test]
    fn key_segments_are_percent_encoded() {
        assert_eq!(encode_key_path("/prod/web/1.0/app cfg"), "/prod/web/1.0/app%20cfg");
        assert_eq!(encode_key_path("/"), "/");
    }
}
