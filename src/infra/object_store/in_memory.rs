// In-memory publisher used by tests.

use async_trait::async_trait;
use dashmap::DashMap;
use serde_json::Value;

use crate::core::sync::{CachePolicy, ObjectPublisher, PublishError};

#[derive(Default)]
pub struct InMemoryPublisher {
    objects: DashMap<String, (Value, CachePolicy)>,
}

impl InMemoryPublisher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn stored(&self, path: &str) -> Option<Value> {
        self.objects.get(path).map(|entry| entry.value().0.clone())
    }

    pub fn cache_policy(&self, path: &str) -> Option<CachePolicy> {
        self.objects.get(path).map(|entry| entry.value().1)
    }
}

#[async_trait]
impl ObjectPublisher for InMemoryPublisher {
    async fn upload(
        &self,
        path: &str,
        body: &Value,
        policy: CachePolicy,
    ) -> Result<(), PublishError> {
        self.objects.insert(path.to_string(), (body.clone(), policy));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn repeated_upload_converges_on_the_same_object() {
        let publisher = InMemoryPublisher::new();
        let body = json!({"headline": "Hello", "tags": ["a", "b"]});

        publisher
            .upload("docsdata-test/doc-1.json", &body, CachePolicy::Test)
            .await
            .unwrap();
        publisher
            .upload("docsdata-test/doc-1.json", &body, CachePolicy::Test)
            .await
            .unwrap();

        assert_eq!(publisher.stored("docsdata-test/doc-1.json"), Some(body));
        assert_eq!(
            publisher.cache_policy("docsdata-test/doc-1.json"),
            Some(CachePolicy::Test)
        );
    }

    #[tokio::test]
    async fn reupload_with_new_content_replaces_the_object() {
        let publisher = InMemoryPublisher::new();
        publisher
            .upload("docsdata/doc-1.json", &json!({"v": 1}), CachePolicy::Prod)
            .await
            .unwrap();
        publisher
            .upload("docsdata/doc-1.json", &json!({"v": 2}), CachePolicy::Prod)
            .await
            .unwrap();

        assert_eq!(publisher.stored("docsdata/doc-1.json"), Some(json!({"v": 2})));
    }
}
