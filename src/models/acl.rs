//! Access control policy attached to an object record.
//!
//! The engine only stores the policy; deciding whether a principal may act
//! is the job of the external policy collaborator.

use serde::{Deserialize, Serialize};

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Owner {
    pub id: String,
    pub display_name: String,
}

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Permission {
    FullControl,
    Read,
    Write,
    ReadAcp,
    WriteAcp,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
#[serde(rename_all = "camelCase", tag = "type")]
pub enum Grantee {
    CanonicalUser { id: String, display_name: String },
    Group { uri: String },
    Email { email: String },
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Grant {
    pub grantee: Grantee,
    pub permission: Permission,
}

/// Owner plus the list of grants for an object.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct AccessControlPolicy {
    pub owner: Owner,
    pub grants: Vec<Grant>,
}

impl AccessControlPolicy {
    /// The default `private` policy: the owner gets full control.
    pub fn private(owner_id: &str) -> Self {
        Self {
            owner: Owner {
                id: owner_id.to_string(),
                display_name: owner_id.to_string(),
            },
            grants: vec![Grant {
                grantee: Grantee::CanonicalUser {
                    id: owner_id.to_string(),
                    display_name: owner_id.to_string(),
                },
                permission: Permission::FullControl,
            }],
        }
    }
}
