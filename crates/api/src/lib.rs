//! fnview function API façade (in-process).
//!
//! The view consumes the function CRUD client only through [`FunctionApi`]. [`InProcApi`]
//! talks to the cluster directly; [`MockApi`] is an in-memory stand-in for tests.

#![forbid(unsafe_code)]

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Instant;

use fnview_core::{FunctionEntity, FunctionTarget, WatchResource};
use kube::{
    api::{Api, DeleteParams, Patch, PatchParams},
    core::{ApiResource, DynamicObject, GroupVersionKind},
    Client,
};
use metrics::counter;
use serde::{Deserialize, Serialize};
use tracing::info;

/// API errors suitable for transport over RPC later.
#[derive(Debug, Clone, thiserror::Error, Serialize, Deserialize, PartialEq, Eq)]
pub enum FnError {
    #[error("not_found: {0}")]
    NotFound(String),
    #[error("conflict: {0}")]
    Conflict(String),
    #[error("validation: {0}")]
    Validation(String),
    #[error("internal: {0}")]
    Internal(String),
}

pub type FnResult<T> = Result<T, FnError>;

/// Function CRUD surface consumed by the view.
#[async_trait::async_trait]
pub trait FunctionApi: Send + Sync {
    async fn get_function(&self, target: &FunctionTarget) -> FnResult<FunctionEntity>;

    /// Persist `entity` and return the refreshed entity as stored by the server.
    async fn update_function(&self, entity: FunctionEntity) -> FnResult<FunctionEntity>;

    async fn delete_function(&self, target: &FunctionTarget) -> FnResult<()>;
}

/// Default function resource: `kubeless.io/v1beta1 functions`.
pub fn function_resource() -> WatchResource {
    WatchResource {
        group: "kubeless.io".into(),
        version: "v1beta1".into(),
        kind: "Function".into(),
        plural: "functions".into(),
    }
}

/// Merge patch sent on update. Carries the whole spec (so at least `spec.function`) and the
/// resource version when known, so a concurrent change surfaces as a conflict.
pub fn update_patch(entity: &FunctionEntity) -> FnResult<serde_json::Value> {
    let spec = serde_json::to_value(&entity.spec).map_err(|e| FnError::Validation(e.to_string()))?;
    let mut patch = serde_json::json!({ "spec": spec });
    if let Some(rv) = &entity.metadata.resource_version {
        patch["metadata"] = serde_json::json!({ "resourceVersion": rv });
    }
    Ok(patch)
}

// ----------------- In-process implementation -----------------

/// In-process implementation backed by a kube client.
pub struct InProcApi {
    client: Client,
    resource: ApiResource,
}

impl InProcApi {
    pub fn new(client: Client, resource: &WatchResource) -> Self {
        let gvk = GroupVersionKind::gvk(&resource.group, &resource.version, &resource.kind);
        Self { client, resource: ApiResource::from_gvk_with_plural(&gvk, &resource.plural) }
    }

    pub async fn try_default() -> anyhow::Result<Self> {
        let client = fnview_kubehub::kube_client().await?;
        Ok(Self::new(client, &function_resource()))
    }

    fn api(&self, namespace: &str) -> Api<DynamicObject> {
        Api::namespaced_with(self.client.clone(), namespace, &self.resource)
    }

    fn map_err(e: kube::Error) -> FnError {
        match e {
            kube::Error::Api(ae) => match ae.code {
                404 => FnError::NotFound(ae.message),
                409 => FnError::Conflict(ae.message),
                400 | 422 => FnError::Validation(ae.message),
                _ => FnError::Internal(ae.message),
            },
            other => FnError::Internal(other.to_string()),
        }
    }

    fn to_entity(obj: DynamicObject) -> FnResult<FunctionEntity> {
        let v = serde_json::to_value(&obj).map_err(|e| FnError::Internal(e.to_string()))?;
        serde_json::from_value(v).map_err(|e| FnError::Internal(format!("decoding function: {}", e)))
    }
}

#[async_trait::async_trait]
impl FunctionApi for InProcApi {
    async fn get_function(&self, target: &FunctionTarget) -> FnResult<FunctionEntity> {
        let t0 = Instant::now();
        info!(function = %target, "api: get_function start");
        let obj = self.api(&target.namespace).get(&target.name).await.map_err(Self::map_err)?;
        let entity = Self::to_entity(obj)?;
        info!(rv = ?entity.metadata.resource_version, took_ms = %t0.elapsed().as_millis(), "api: get_function ok");
        Ok(entity)
    }

    async fn update_function(&self, entity: FunctionEntity) -> FnResult<FunctionEntity> {
        let t0 = Instant::now();
        let target = entity.target();
        info!(function = %target, bytes = entity.spec.function.len(), "api: update_function start");
        counter!("function_update_attempts", 1u64);
        let patch = update_patch(&entity)?;
        let res = self
            .api(&target.namespace)
            .patch(&target.name, &PatchParams::default(), &Patch::Merge(&patch))
            .await;
        match res {
            Ok(obj) => {
                let entity = Self::to_entity(obj)?;
                info!(rv = ?entity.metadata.resource_version, took_ms = %t0.elapsed().as_millis(), "api: update_function ok");
                Ok(entity)
            }
            Err(e) => {
                counter!("function_update_errors", 1u64);
                let err = Self::map_err(e);
                info!(error = %err, took_ms = %t0.elapsed().as_millis(), "api: update_function failed");
                Err(err)
            }
        }
    }

    async fn delete_function(&self, target: &FunctionTarget) -> FnResult<()> {
        let t0 = Instant::now();
        info!(function = %target, "api: delete_function start");
        self.api(&target.namespace)
            .delete(&target.name, &DeleteParams::default())
            .await
            .map_err(Self::map_err)?;
        info!(took_ms = %t0.elapsed().as_millis(), "api: delete_function ok");
        Ok(())
    }
}

// ----------------- Mock implementation -----------------

/// Simple in-memory mock implementation for tests.
///
/// Updates bump `metadata.resourceVersion` and become the stored entity, like a server would.
#[derive(Default)]
pub struct MockApi {
    function: Mutex<Option<FunctionEntity>>,
    update_error: Mutex<Option<FnError>>,
    updates: Mutex<Vec<FunctionEntity>>,
    deletes: Mutex<Vec<FunctionTarget>>,
    gets: AtomicUsize,
}

impl MockApi {
    pub fn new() -> Self { Self::default() }

    pub fn with_function(entity: FunctionEntity) -> Self {
        let api = Self::default();
        api.set_function(Some(entity));
        api
    }

    pub fn set_function(&self, entity: Option<FunctionEntity>) { *self.function.lock().unwrap() = entity; }

    /// Make every following update fail with `err` (or succeed again with `None`).
    pub fn fail_updates(&self, err: Option<FnError>) { *self.update_error.lock().unwrap() = err; }

    pub fn updates(&self) -> Vec<FunctionEntity> { self.updates.lock().unwrap().clone() }
    pub fn deletes(&self) -> Vec<FunctionTarget> { self.deletes.lock().unwrap().clone() }
    pub fn get_count(&self) -> usize { self.gets.load(Ordering::SeqCst) }
}

#[async_trait::async_trait]
impl FunctionApi for MockApi {
    async fn get_function(&self, target: &FunctionTarget) -> FnResult<FunctionEntity> {
        self.gets.fetch_add(1, Ordering::SeqCst);
        self.function
            .lock()
            .unwrap()
            .clone()
            .filter(|f| f.target() == *target)
            .ok_or_else(|| FnError::NotFound(target.to_string()))
    }

    async fn update_function(&self, entity: FunctionEntity) -> FnResult<FunctionEntity> {
        self.updates.lock().unwrap().push(entity.clone());
        if let Some(err) = self.update_error.lock().unwrap().clone() {
            return Err(err);
        }
        let mut stored = entity;
        let next_rv = stored
            .metadata
            .resource_version
            .as_deref()
            .and_then(|rv| rv.parse::<u64>().ok())
            .map_or(1, |rv| rv + 1);
        stored.metadata.resource_version = Some(next_rv.to_string());
        *self.function.lock().unwrap() = Some(stored.clone());
        Ok(stored)
    }

    async fn delete_function(&self, target: &FunctionTarget) -> FnResult<()> {
        self.deletes.lock().unwrap().push(target.clone());
        let mut f = self.function.lock().unwrap();
        if f.as_ref().map(|e| e.target() == *target).unwrap_or(false) {
            *f = None;
            Ok(())
        } else {
            Err(FnError::NotFound(target.to_string()))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fnview_core::{FunctionMeta, FunctionSpec};

    fn entity(rv: Option<&str>) -> FunctionEntity {
        FunctionEntity {
            metadata: FunctionMeta {
                name: "hello".into(),
                namespace: "default".into(),
                resource_version: rv.map(str::to_string),
                ..Default::default()
            },
            spec: FunctionSpec { runtime: "python3.7".into(), function: "def h(): pass".into(), ..Default::default() },
            ..Default::default()
        }
    }

    #[test]
    fn update_patch_carries_function_and_resource_version() {
        let p = update_patch(&entity(Some("12"))).expect("patch");
        assert_eq!(p.pointer("/spec/function"), Some(&serde_json::json!("def h(): pass")));
        assert_eq!(p.pointer("/spec/runtime"), Some(&serde_json::json!("python3.7")));
        assert_eq!(p.pointer("/metadata/resourceVersion"), Some(&serde_json::json!("12")));

        let p = update_patch(&entity(None)).expect("patch");
        assert!(p.get("metadata").is_none());
    }

    #[test]
    fn function_resource_is_kubeless() {
        let r = function_resource();
        assert_eq!(r.api_version(), "kubeless.io/v1beta1");
        assert_eq!(r.plural, "functions");
    }

    #[tokio::test]
    async fn mock_update_bumps_resource_version() {
        let api = MockApi::with_function(entity(Some("3")));
        let out = api.update_function(entity(Some("3")).with_source("new")).await.expect("update");
        assert_eq!(out.metadata.resource_version.as_deref(), Some("4"));
        let got = api.get_function(&FunctionTarget::new("default", "hello")).await.expect("get");
        assert_eq!(got.spec.function, "new");
        assert_eq!(api.updates().len(), 1);
        assert_eq!(api.get_count(), 1);
    }

    #[tokio::test]
    async fn mock_update_failure_is_reported() {
        let api = MockApi::with_function(entity(Some("3")));
        api.fail_updates(Some(FnError::Conflict("stale".into())));
        let err = api.update_function(entity(Some("3"))).await.unwrap_err();
        assert_eq!(err, FnError::Conflict("stale".into()));
        let got = api.get_function(&FunctionTarget::new("default", "hello")).await.expect("get");
        assert_eq!(got.metadata.resource_version.as_deref(), Some("3"));
    }

    #[tokio::test]
    async fn mock_get_and_delete_unknown_target() {
        let api = MockApi::new();
        let t = FunctionTarget::new("default", "missing");
        assert!(matches!(api.get_function(&t).await, Err(FnError::NotFound(_))));
        assert!(matches!(api.delete_function(&t).await, Err(FnError::NotFound(_))));
        assert_eq!(api.deletes(), vec![t]);
    }
}
