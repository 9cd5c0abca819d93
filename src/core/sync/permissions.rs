// Domain-permission resolution.
//
// Purely informational: the dashboard shows whether a file is shared with
// the required domain, but nothing here ever blocks a publish.

use crate::core::source::{DocumentSource, SourceError};
use crate::core::sync::DomainPermission;

/// Resolves a file's sharing status against the required domain name.
///
/// An empty `required_domain` disables the check entirely (no API call).
/// Otherwise: a sharing entry named after the domain contributes its role;
/// failing that, an entry matching the service account's own email means the
/// file was shared with us but not the domain (`none`); anything else is
/// `unknown`.
pub async fn resolve_domain_permission(
    source: &dyn DocumentSource,
    file_id: &str,
    required_domain: &str,
    service_account_email: &str,
) -> Result<DomainPermission, SourceError> {
    if required_domain.is_empty() {
        return Ok(DomainPermission::Disabled);
    }

    let entries = source.list_permissions(file_id).await?;

    let domain_entry = entries
        .iter()
        .find(|entry| entry.name.as_deref() == Some(required_domain));
    if let Some(role) = domain_entry.and_then(|entry| entry.role.clone()) {
        return Ok(DomainPermission::Role(role));
    }

    let shared_with_service_account = entries
        .iter()
        .any(|entry| entry.email_address.as_deref() == Some(service_account_email));
    if shared_with_service_account {
        Ok(DomainPermission::None)
    } else {
        Ok(DomainPermission::Unknown)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;

    use crate::core::source::PermissionEntry;

    struct FakePermissions {
        entries: Vec<PermissionEntry>,
    }

    #[async_trait]
    impl DocumentSource for FakePermissions {
        async fn export_plain_text(&self, _: &str) -> Result<String, SourceError> {
            unimplemented!("not used")
        }

        async fn list_sheet_titles(&self, _: &str) -> Result<Vec<String>, SourceError> {
            unimplemented!("not used")
        }

        async fn fetch_sheet_values(
            &self,
            _: &str,
            _: &str,
        ) -> Result<Vec<Vec<String>>, SourceError> {
            unimplemented!("not used")
        }

        async fn list_permissions(&self, _: &str) -> Result<Vec<PermissionEntry>, SourceError> {
            Ok(self.entries.clone())
        }
    }

    fn entry(name: Option<&str>, email: Option<&str>, role: Option<&str>) -> PermissionEntry {
        PermissionEntry {
            name: name.map(str::to_string),
            email_address: email.map(str::to_string),
            role: role.map(str::to_string),
        }
    }

    #[tokio::test]
    async fn empty_domain_disables_the_check() {
        let source = FakePermissions { entries: vec![] };
        let status = resolve_domain_permission(&source, "f1", "", "svc@example.iam")
            .await
            .unwrap();
        assert_eq!(status, DomainPermission::Disabled);
    }

    #[tokio::test]
    async fn matching_domain_entry_contributes_its_role() {
        let source = FakePermissions {
            entries: vec![
                entry(Some("someone"), None, Some("owner")),
                entry(Some("example.org"), None, Some("reader")),
            ],
        };
        let status = resolve_domain_permission(&source, "f1", "example.org", "svc@example.iam")
            .await
            .unwrap();
        assert_eq!(status, DomainPermission::Role("reader".to_string()));
    }

    #[tokio::test]
    async fn shared_with_service_account_only_is_none() {
        let source = FakePermissions {
            entries: vec![entry(None, Some("svc@example.iam"), Some("reader"))],
        };
        let status = resolve_domain_permission(&source, "f1", "example.org", "svc@example.iam")
            .await
            .unwrap();
        assert_eq!(status, DomainPermission::None);
    }

    #[tokio::test]
    async fn no_interpretable_entry_is_unknown() {
        let source = FakePermissions {
            entries: vec![entry(Some("other.org"), Some("who@else"), Some("writer"))],
        };
        let status = resolve_domain_permission(&source, "f1", "example.org", "svc@example.iam")
            .await
            .unwrap();
        assert_eq!(status, DomainPermission::Unknown);
    }

    #[tokio::test]
    async fn domain_entry_without_role_falls_through() {
        let source = FakePermissions {
            entries: vec![
                entry(Some("example.org"), None, None),
                entry(None, Some("svc@example.iam"), None),
            ],
        };
        let status = resolve_domain_permission(&source, "f1", "example.org", "svc@example.iam")
            .await
            .unwrap();
        assert_eq!(status, DomainPermission::None);
    }
}
