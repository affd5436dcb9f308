//! Network profiles
//!
//! Protocol constants that distinguish independent deployments of the
//! same protocol. A profile is selected once and passed explicitly to
//! whatever needs it.

use serde::{Deserialize, Serialize};

/// Maximum message size shared by every network (MAX_SIZE)
pub const MAX_MESSAGE_SIZE: usize = 0x0200_0000;

/// Protocol version advertised in `version` messages (Bitcoin Core v0.12.0)
pub const PROTOCOL_VERSION: u32 = 70012;

/// Deployment selector
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum Network {
    #[default]
    Mainnet,
    Testnet,
    Regtest,
}

impl Network {
    pub fn name(&self) -> &'static str {
        match self {
            Network::Mainnet => "mainnet",
            Network::Testnet => "testnet",
            Network::Regtest => "regtest",
        }
    }

    pub fn profile(&self) -> NetworkProfile {
        NetworkProfile::for_network(*self)
    }
}

impl std::fmt::Display for Network {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// Address version bytes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AddressVersions {
    pub pub_key_hash: u8,
    pub script_hash: u8,
}

/// BIP32 extended key version prefixes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Bip32Versions {
    pub pub_key: u32,
    pub priv_key: u32,
}

/// Fee and dust policy used when building transactions
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FeePolicy {
    /// Satoshis per kilobyte
    pub fee_per_kb: u64,
    /// Outputs below this value are dust
    pub dust: u64,
}

/// Rendezvous endpoint used to broker message-oriented channels
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Rendezvous {
    pub host: &'static str,
    pub port: u16,
    pub path: &'static str,
}

/// Peer connection policy
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerPolicy {
    /// Default peer port
    pub port: u16,
    pub min_connections: usize,
    pub max_connections: usize,
    pub rendezvous: Rendezvous,
}

/// Read-only protocol constants for one network
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NetworkProfile {
    pub network: Network,
    /// Message start magic, written big-endian on the wire
    pub magic: u32,
    pub protocol_version: u32,
    pub max_message_size: usize,
    pub address: AddressVersions,
    pub bip32: Bip32Versions,
    /// Block header `nBits` ceiling
    pub max_nbits: u32,
    pub priv_key_version: u8,
    pub stealth_address_version: u8,
    pub fees: FeePolicy,
    pub peers: PeerPolicy,
}

const DEFAULT_RENDEZVOUS: Rendezvous = Rendezvous {
    host: "localhost",
    port: 3000,
    path: "/",
};

impl NetworkProfile {
    pub fn mainnet() -> Self {
        Self {
            network: Network::Mainnet,
            magic: 0xf9be_b4d9,
            protocol_version: PROTOCOL_VERSION,
            max_message_size: MAX_MESSAGE_SIZE,
            address: AddressVersions {
                pub_key_hash: 0x00,
                script_hash: 0x05,
            },
            bip32: Bip32Versions {
                pub_key: 0x0488_b21e,
                priv_key: 0x0488_ade4,
            },
            max_nbits: 0x1d00_ffff,
            priv_key_version: 0x80,
            stealth_address_version: 42,
            fees: FeePolicy {
                fee_per_kb: 10_000,
                dust: 546,
            },
            peers: PeerPolicy {
                port: 8333,
                min_connections: 8,
                max_connections: 20,
                rendezvous: DEFAULT_RENDEZVOUS,
            },
        }
    }

    pub fn testnet() -> Self {
        Self {
            network: Network::Testnet,
            magic: 0x0b11_0907,
            address: AddressVersions {
                pub_key_hash: 0x6f,
                script_hash: 0xc4,
            },
            bip32: Bip32Versions {
                pub_key: 0x0435_87cf,
                priv_key: 0x0435_8394,
            },
            priv_key_version: 0xef,
            stealth_address_version: 43,
            ..Self::mainnet()
        }
    }

    /// Regtest shares mainnet's keys and magic and differs only in its port
    pub fn regtest() -> Self {
        let mainnet = Self::mainnet();
        Self {
            network: Network::Regtest,
            peers: PeerPolicy {
                port: 18444,
                ..mainnet.peers.clone()
            },
            ..mainnet
        }
    }

    pub fn for_network(network: Network) -> Self {
        match network {
            Network::Mainnet => Self::mainnet(),
            Network::Testnet => Self::testnet(),
            Network::Regtest => Self::regtest(),
        }
    }

    /// Magic as it appears on the wire
    pub fn magic_bytes(&self) -> [u8; 4] {
        self.magic.to_be_bytes()
    }
}

impl Default for NetworkProfile {
    fn default() -> Self {
        Self::mainnet()
    }
}
