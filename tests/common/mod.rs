//! Fixtures shared by the integration tests
#![allow(dead_code)]

use std::sync::Arc;

use tollgate::blockchain::OrganizationMetaData;
use tollgate::storage::{FixedStore, MemoryStore};
use tollgate::training::{ModelData, ModelRegistry, Scope, Status};

pub const ORG_ID: &str = "test_org_id";
pub const GROUP_NAME: &str = "default_group";

pub fn metadata_json(endpoints: &[&str]) -> String {
    serde_json::json!({
        "org_name": "organization_name",
        "org_id": ORG_ID,
        "groups": [
            {
                "group_name": GROUP_NAME,
                "group_id": "99ybRIg2wAx55mqVsA6sB4S7WxPQHNKqa4BPu/bhj+U=",
                "payment": {
                    "payment_address": "0x671276c61943A35D5F230d076bDFd91B0c47bF09",
                    "payment_expiration_threshold": 40320,
                    "payment_channel_storage_type": "etcd",
                    "payment_channel_storage_client": {
                        "connection_timeout": "15s",
                        "request_timeout": "13s",
                        "endpoints": endpoints
                    }
                }
            }
        ]
    })
    .to_string()
}

pub fn metadata(endpoints: &[&str]) -> OrganizationMetaData {
    OrganizationMetaData::from_json(metadata_json(endpoints).as_bytes(), GROUP_NAME).unwrap()
}

pub fn scope() -> Scope {
    Scope::new("org1", "svc1", "grp1")
}

pub fn model(id: &str, status: Status) -> ModelData {
    ModelData {
        model_id: id.to_string(),
        organization_id: "org1".to_string(),
        service_id: "svc1".to_string(),
        group_id: "grp1".to_string(),
        model_name: format!("model-{}", id),
        description: String::new(),
        grpc_service_name: "Trainer".to_string(),
        grpc_method_name: "train".to_string(),
        training_link: String::new(),
        updated_date: String::new(),
        is_public: false,
        authorized_addresses: vec!["0xAAA".to_string()],
        created_by_address: "0xCreator".to_string(),
        updated_by_address: "0xCreator".to_string(),
        is_default: false,
        status,
    }
}

/// Registry over a fresh memory store; the store handle shares its data
pub fn memory_registry() -> (ModelRegistry, MemoryStore) {
    let store = MemoryStore::new();
    let registry = ModelRegistry::new(Arc::new(FixedStore(Arc::new(store.share()))));
    (registry, store)
}
