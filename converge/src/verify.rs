//! Checks that the backend agrees with what the controller believes.
//!
//! The controller uses [`Verifier::confirm_destroyed`] before it forgets a
//! resource; tests use the rest to make assertions against remote state.

use std::{future::Future, time::Duration};

use converge_resource::{
    value, AttributePath, AttributeValue, Attributes, Operation, ProviderError, ProviderResult,
    ResourceProvider,
};

use crate::{
    error::{Error, Result},
    lifecycle::ResourceInstance,
};

/// Bound a backend call by `timeout`, if any.
pub(crate) async fn with_timeout<T>(
    timeout: Option<Duration>,
    call: impl Future<Output = ProviderResult<T>>,
) -> ProviderResult<T> {
    match timeout {
        None => call.await,
        Some(t) => match tokio::time::timeout(t, call).await {
            Ok(r) => r,
            Err(_) => Err(ProviderError::Timeout(t)),
        },
    }
}

pub struct Verifier<'a> {
    provider: &'a dyn ResourceProvider,
    call_timeout: Option<Duration>,
}

impl<'a> Verifier<'a> {
    pub fn new(provider: &'a dyn ResourceProvider) -> Verifier<'a> {
        Verifier {
            provider,
            call_timeout: None,
        }
    }

    pub fn with_call_timeout(mut self, timeout: Option<Duration>) -> Verifier<'a> {
        self.call_timeout = timeout;
        self
    }

    /// Whether the backend still has the instance. An instance without a
    /// backend id was never created.
    pub async fn exists(&self, instance: &ResourceInstance) -> Result<bool> {
        let Some(id) = &instance.backend_id else {
            return Ok(false);
        };
        match with_timeout(self.call_timeout, self.provider.exists(id)).await {
            Ok(exists) => Ok(exists),
            Err(e) if e.is_not_found() => Ok(false),
            Err(source) => Err(Error::Backend {
                operation: Operation::Exists,
                name: instance.name.clone(),
                source,
            }),
        }
    }

    /// Read the instance from the backend and compare the attributes at the
    /// given paths.
    pub async fn assert_attributes<S: AsRef<str>>(
        &self,
        instance: &ResourceInstance,
        expected: &[(S, AttributeValue)],
    ) -> Result<()> {
        let actual = self.read(instance).await?;
        check_attributes(&instance.name, &actual, expected)
    }

    /// Succeeds only when the backend positively reports the instance gone.
    /// A failing check leaves the outcome unknown and is reported as such.
    pub async fn confirm_destroyed(&self, instance: &ResourceInstance) -> Result<()> {
        let Some(id) = &instance.backend_id else {
            return Ok(());
        };
        if self.exists(instance).await? {
            tracing::error!(resource = %instance.name, id = %id, "resource still exists after destroy");
            return Err(Error::StillExists {
                name: instance.name.clone(),
                id: id.clone(),
            });
        }
        Ok(())
    }

    pub async fn read(&self, instance: &ResourceInstance) -> Result<Attributes> {
        let id = instance
            .backend_id
            .as_ref()
            .ok_or_else(|| Error::Backend {
                operation: Operation::Read,
                name: instance.name.clone(),
                source: ProviderError::Other(anyhow::anyhow!("resource has no backend id")),
            })?;
        with_timeout(self.call_timeout, self.provider.read(id))
            .await
            .map_err(|source| Error::Backend {
                operation: Operation::Read,
                name: instance.name.clone(),
                source,
            })
    }
}

/// Compare attributes at flat paths such as `parameter.0.value`.
pub fn check_attributes<S: AsRef<str>>(
    name: &str,
    actual: &Attributes,
    expected: &[(S, AttributeValue)],
) -> Result<()> {
    for (path, want) in expected {
        let path: AttributePath = path.as_ref().into();
        let got = value::lookup(actual, &path);
        if got != Some(want) {
            return Err(Error::AssertionFailed {
                name: name.to_string(),
                path,
                expected: want.clone(),
                actual: got.cloned(),
            });
        }
    }
    Ok(())
}

/// Compare a block list with `expected`, ignoring order.
pub fn check_block_set(
    name: &str,
    actual: &Attributes,
    attribute: &str,
    expected: &[AttributeValue],
) -> Result<()> {
    let got = actual
        .get(attribute)
        .and_then(|v| v.as_list())
        .unwrap_or_default();
    let mut remaining: Vec<&AttributeValue> = got.iter().collect();
    let all_found = expected.iter().all(|want| {
        match remaining.iter().position(|v| *v == want) {
            Some(pos) => {
                remaining.swap_remove(pos);
                true
            }
            None => false,
        }
    });
    if !all_found || !remaining.is_empty() {
        return Err(Error::AssertionFailed {
            name: name.to_string(),
            path: AttributePath::root().attr(attribute),
            expected: AttributeValue::List(expected.to_vec()),
            actual: actual.get(attribute).cloned(),
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use converge_resource::{memory::MemoryProvider, BackendId};

    fn attrs(json: serde_json::Value) -> Attributes {
        serde_json::from_value(json).unwrap()
    }

    #[test]
    fn flat_paths() {
        let actual = attrs(serde_json::json!({
            "name": "pg",
            "parameter": [{"name": "character_set_server", "value": "utf8"}]
        }));
        check_attributes(
            "pg",
            &actual,
            &[
                ("name", "pg".into()),
                ("parameter.0.value", "utf8".into()),
            ],
        )
        .unwrap();
        let err = check_attributes("pg", &actual, &[("parameter.1.value", "utf8".into())])
            .unwrap_err();
        assert_eq!(
            err.to_string(),
            "resource pg: parameter.1.value is unset, expected \"utf8\""
        );
    }

    #[test]
    fn block_sets_ignore_order() {
        let a = AttributeValue::Block(attrs(serde_json::json!({"name": "a", "value": "1"})));
        let b = AttributeValue::Block(attrs(serde_json::json!({"name": "b", "value": "2"})));
        let actual = [(
            "parameter".to_string(),
            AttributeValue::List(vec![b.clone(), a.clone()]),
        )]
        .into_iter()
        .collect();
        check_block_set("pg", &actual, "parameter", &[a.clone(), b.clone()]).unwrap();
        assert!(check_block_set("pg", &actual, "parameter", &[a.clone()]).is_err());
        assert!(check_block_set("pg", &actual, "parameter", &[a.clone(), a, b]).is_err());
        assert!(check_block_set("pg", &Attributes::new(), "parameter", &[]).is_ok());
    }

    #[tokio::test]
    async fn confirm_destroyed_outcomes() {
        let p = MemoryProvider::new();
        let created = p.create(&Attributes::new()).await.unwrap();
        let instance = ResourceInstance::present("pg", created.id.clone(), Attributes::new());
        let verifier = Verifier::new(&p);

        assert!(verifier.exists(&instance).await.unwrap());
        assert!(matches!(
            verifier.confirm_destroyed(&instance).await,
            Err(Error::StillExists { .. })
        ));

        p.fail_next(
            Operation::Exists,
            converge_resource::memory::Failure::Error("throttled".to_string()),
        );
        p.remove_out_of_band(&created.id);
        assert!(matches!(
            verifier.confirm_destroyed(&instance).await,
            Err(Error::Backend {
                operation: Operation::Exists,
                ..
            })
        ));
        verifier.confirm_destroyed(&instance).await.unwrap();

        let never_created = ResourceInstance::absent("other");
        verifier.confirm_destroyed(&never_created).await.unwrap();
        assert!(!verifier.exists(&never_created).await.unwrap());

        let missing = ResourceInstance::present("gone", BackendId::from("mem-9"), Attributes::new());
        assert!(verifier.read(&missing).await.unwrap_err().provider_error().unwrap().is_not_found());
    }
}
