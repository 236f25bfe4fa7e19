// Copyright (c) 2019 Cloudflare, Inc. All rights reserved.
// SPDX-License-Identifier: BSD-3-Clause

//! Typed mirror of the §6 configuration JSON shape. `serde_json` is the
//! only parse entry point; the reconciler (`crate::reconciler`) never sees
//! a `serde_json::Value` or an untyped map, only these structs, per the
//! "JSON layer never a runtime consumer of untyped maps" re-architecture
//! note.

use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("config JSON did not parse: {0}")]
    Malformed(#[from] serde_json::Error),
    #[error("peer {0} has a public key that is not valid base64 or not 32 bytes")]
    BadPublicKey(usize),
    #[error("peer {0} has private_ip/private_mask that does not parse as an IPv4 CIDR")]
    BadAllowedIp(usize),
    #[error("interface private_ip/private_mask does not parse as an IPv4 address/mask")]
    BadInterfaceAddress,
    #[error("peer {0} declares {1} endpoints, exceeding the 16-endpoint limit")]
    TooManyEndpoints(usize, usize),
    #[error("ACL program {0} failed validation: {1}")]
    BadAclProgram(usize, crate::acl::AclError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NatType {
    Open,
    Moderate,
    Symmetric,
}

impl From<NatType> for crate::traits::NatType {
    fn from(n: NatType) -> crate::traits::NatType {
        match n {
            NatType::Open => crate::traits::NatType::Open,
            NatType::Moderate => crate::traits::NatType::Moderate,
            NatType::Symmetric => crate::traits::NatType::Symmetric,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EndpointType {
    Direct,
    Proxy,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceAddress {
    pub address: String,
    pub port: u16,
    #[serde(rename = "type")]
    pub kind: EndpointType,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InterfaceBlock {
    pub name: String,
    pub device_uuid: Uuid,
    pub private_ip: String,
    pub private_mask: u8,
    pub mtu: u16,
    pub listen_port: u16,
    pub nat_type: NatType,
    pub remote_addr: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PeerConfig {
    pub wireguard_pubkey: String,
    pub private_ip: String,
    pub private_mask: u8,
    pub nat_type: NatType,
    #[serde(default)]
    pub otp_sender: u64,
    #[serde(default)]
    pub otp_receiver: [u64; 3],
    pub device_addresses: Vec<DeviceAddress>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AclDefaultPolicy {
    Allow,
    Block,
}

impl From<AclDefaultPolicy> for crate::acl::DefaultPolicy {
    fn from(p: AclDefaultPolicy) -> crate::acl::DefaultPolicy {
        match p {
            AclDefaultPolicy::Allow => crate::acl::DefaultPolicy::Allow,
            AclDefaultPolicy::Block => crate::acl::DefaultPolicy::Block,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AclBlock {
    pub default_policy: AclDefaultPolicy,
    /// Each program is an array of `[code, jt, jf, k]` 4-tuples; the
    /// reconciler decodes these positionally into `acl::Insn`, never by
    /// field name, per §4.8.
    pub programs: Vec<Vec<[i64; 4]>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WireConfig {
    pub etag: String,
    pub interface: InterfaceBlock,
    pub peers: Vec<PeerConfig>,
    pub acl: AclBlock,
}

impl WireConfig {
    pub fn from_json(s: &str) -> Result<WireConfig, ConfigError> {
        Ok(serde_json::from_str(s)?)
    }

    pub fn from_slice(b: &[u8]) -> Result<WireConfig, ConfigError> {
        Ok(serde_json::from_slice(b)?)
    }

    pub fn to_json(&self) -> String {
        serde_json::to_string(self).expect("WireConfig serializes infallibly")
    }
}
