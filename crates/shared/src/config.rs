use serde::Deserialize;
use std::env;
use std::net::SocketAddr;

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub mesh: MeshConfig,
    pub ledger: LedgerConfig,
    pub gateway: GatewayConfig,
    pub connectivity: ConnectivityConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct MeshConfig {
    /// Broadcast scheduler period in milliseconds (default: 250)
    pub tick_interval_ms: u64,
    /// Delay before a fresh receive handle is acquired after a full clear (default: 500)
    pub relisten_delay_ms: u64,
    /// Local address the development UDP transport listens on
    pub udp_listen_addr: SocketAddr,
    /// Address every chunk is sent to by the development UDP transport
    pub udp_broadcast_addr: SocketAddr,
    /// Per-packet ceiling of the radio transport in bytes (default: 9)
    pub max_packet_size: usize,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LedgerConfig {
    pub rpc_url: String,
    pub chain_id: Option<u64>,
    pub relayer_address: String,
    pub explorer_tx_url: String,
    pub receipt_poll_interval_ms: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct GatewayConfig {
    pub connection_timeout_secs: u64,
    pub balance_timeout_secs: u64,
    /// Shared budget for transaction submission and confirmation
    pub submission_timeout_secs: u64,
    pub check_sender_balance: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ConnectivityConfig {
    pub probe_interval_secs: u64,
    /// Pins the connectivity flag instead of probing the ledger
    pub forced: Option<bool>,
}

impl Config {
    pub fn from_env() -> anyhow::Result<Self> {
        dotenv::dotenv().ok();

        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Build the configuration from an arbitrary key lookup
    pub fn from_lookup<F>(lookup: F) -> anyhow::Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let var = |key: &str, default: &str| lookup(key).unwrap_or_else(|| default.to_string());
        let required = |key: &str| {
            lookup(key).ok_or_else(|| anyhow::anyhow!("missing required environment variable {}", key))
        };
        // Periods drive tokio intervals, which panic on zero
        let period = |key: &str, default: &str| -> anyhow::Result<u64> {
            match var(key, default).parse::<u64>()? {
                0 => anyhow::bail!("{} must be greater than zero", key),
                value => Ok(value),
            }
        };

        Ok(Config {
            mesh: MeshConfig {
                tick_interval_ms: period("MESH_TICK_INTERVAL_MS", "250")?,
                relisten_delay_ms: var("MESH_RELISTEN_DELAY_MS", "500").parse()?,
                udp_listen_addr: var("MESH_UDP_LISTEN_ADDR", "0.0.0.0:47800").parse()?,
                udp_broadcast_addr: var("MESH_UDP_BROADCAST_ADDR", "255.255.255.255:47800")
                    .parse()?,
                max_packet_size: var("MESH_MAX_PACKET_SIZE", "9").parse()?,
            },
            ledger: LedgerConfig {
                rpc_url: required("LEDGER_RPC_URL")?,
                chain_id: lookup("LEDGER_CHAIN_ID").map(|v| v.parse()).transpose()?,
                relayer_address: required("LEDGER_RELAYER_ADDRESS")?,
                explorer_tx_url: var(
                    "LEDGER_EXPLORER_TX_URL",
                    "https://evm-testnet.flowscan.io/tx/",
                ),
                receipt_poll_interval_ms: period("LEDGER_RECEIPT_POLL_MS", "1000")?,
            },
            gateway: GatewayConfig {
                connection_timeout_secs: var("GATEWAY_CONNECTION_TIMEOUT_SECS", "10").parse()?,
                balance_timeout_secs: var("GATEWAY_BALANCE_TIMEOUT_SECS", "10").parse()?,
                submission_timeout_secs: var("GATEWAY_SUBMISSION_TIMEOUT_SECS", "120").parse()?,
                check_sender_balance: var("GATEWAY_CHECK_SENDER_BALANCE", "true").parse()?,
            },
            connectivity: ConnectivityConfig {
                probe_interval_secs: period("CONNECTIVITY_PROBE_INTERVAL_SECS", "15")?,
                forced: match lookup("CONNECTIVITY_FORCE").as_deref() {
                    None | Some("") => None,
                    Some("online") => Some(true),
                    Some("offline") => Some(false),
                    Some(other) => anyhow::bail!(
                        "CONNECTIVITY_FORCE must be 'online' or 'offline', got '{}'",
                        other
                    ),
                },
            },
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup_from(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_defaults_applied() {
        let config = Config::from_lookup(lookup_from(&[
            ("LEDGER_RPC_URL", "http://localhost:8545"),
            ("LEDGER_RELAYER_ADDRESS", "0x742d35Cc6634C0532925a3b844Bc9e7595f0bEb0"),
        ]))
        .unwrap();

        assert_eq!(config.mesh.tick_interval_ms, 250);
        assert_eq!(config.mesh.relisten_delay_ms, 500);
        assert_eq!(config.mesh.max_packet_size, 9);
        assert_eq!(config.mesh.udp_listen_addr.port(), 47800);
        assert_eq!(config.ledger.chain_id, None);
        assert_eq!(config.gateway.connection_timeout_secs, 10);
        assert_eq!(config.gateway.balance_timeout_secs, 10);
        assert_eq!(config.gateway.submission_timeout_secs, 120);
        assert!(config.gateway.check_sender_balance);
        assert_eq!(config.connectivity.forced, None);
    }

    #[test]
    fn test_missing_rpc_url_rejected() {
        let result = Config::from_lookup(lookup_from(&[(
            "LEDGER_RELAYER_ADDRESS",
            "0x742d35Cc6634C0532925a3b844Bc9e7595f0bEb0",
        )]));
        assert!(result.is_err());
    }

    #[test]
    fn test_overrides_parsed() {
        let config = Config::from_lookup(lookup_from(&[
            ("LEDGER_RPC_URL", "http://localhost:8545"),
            ("LEDGER_RELAYER_ADDRESS", "0x742d35Cc6634C0532925a3b844Bc9e7595f0bEb0"),
            ("LEDGER_CHAIN_ID", "545"),
            ("MESH_TICK_INTERVAL_MS", "100"),
            ("GATEWAY_CHECK_SENDER_BALANCE", "false"),
            ("CONNECTIVITY_FORCE", "offline"),
        ]))
        .unwrap();

        assert_eq!(config.ledger.chain_id, Some(545));
        assert_eq!(config.mesh.tick_interval_ms, 100);
        assert!(!config.gateway.check_sender_balance);
        assert_eq!(config.connectivity.forced, Some(false));
    }

    #[test]
    fn test_invalid_connectivity_force_rejected() {
        let result = Config::from_lookup(lookup_from(&[
            ("LEDGER_RPC_URL", "http://localhost:8545"),
            ("LEDGER_RELAYER_ADDRESS", "0x742d35Cc6634C0532925a3b844Bc9e7595f0bEb0"),
            ("CONNECTIVITY_FORCE", "sometimes"),
        ]));
        assert!(result.is_err());
    }

    #[test]
    fn test_zero_periods_rejected() {
        for key in [
            "MESH_TICK_INTERVAL_MS",
            "CONNECTIVITY_PROBE_INTERVAL_SECS",
            "LEDGER_RECEIPT_POLL_MS",
        ] {
            let result = Config::from_lookup(lookup_from(&[
                ("LEDGER_RPC_URL", "http://localhost:8545"),
                ("LEDGER_RELAYER_ADDRESS", "0x742d35Cc6634C0532925a3b844Bc9e7595f0bEb0"),
                (key, "0"),
            ]));
            let err = result.unwrap_err().to_string();
            assert!(err.contains(key), "unexpected error: {}", err);
        }
    }
}
