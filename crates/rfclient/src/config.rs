//! CLI surface (spec section 6): `agent [-a <ipc-address>] [-f] [-i <iface>]
//! [-n <hex-id>] [-h] [-v]`. `-h`/`-v` and unknown-flag rejection are
//! `clap`'s own `--help`/`--version`/error handling, which already satisfy
//! the spec's exit-code requirements without extra code.

use clap::Parser;

/// Default IPC endpoint when `-a` is not given.
pub const DEFAULT_IPC_ADDRESS: &str = "127.0.0.1:6633";

#[derive(Debug, Clone, Parser)]
#[command(name = "rfclient", version, about = "RouteFlow per-virtual-router agent")]
pub struct Config {
    /// Overrides the IPC endpoint of the central rfserver.
    #[arg(short = 'a', long = "ipc-address", default_value = DEFAULT_IPC_ADDRESS)]
    pub ipc_address: String,

    /// Selects the FPM adapter instead of the default NL-adapter.
    #[arg(short = 'f', long = "fpm")]
    pub fpm: bool,

    /// Interface whose MAC derives vm_id when `-n` is not given.
    #[arg(short = 'i', long = "interface", default_value = "eth0")]
    pub interface: String,

    /// Sets vm_id explicitly, in hex (overrides `-i`).
    #[arg(short = 'n', long = "vm-id", value_parser = parse_hex_vm_id)]
    pub vm_id: Option<u64>,
}

fn parse_hex_vm_id(s: &str) -> Result<u64, String> {
    let s = s.strip_prefix("0x").unwrap_or(s);
    u64::from_str_radix(s, 16).map_err(|e| format!("invalid hex vm_id {s:?}: {e}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_spec() {
        let cfg = Config::parse_from(["rfclient"]);
        assert_eq!(cfg.ipc_address, DEFAULT_IPC_ADDRESS);
        assert!(!cfg.fpm);
        assert_eq!(cfg.interface, "eth0");
        assert_eq!(cfg.vm_id, None);
    }

    #[test]
    fn parses_hex_vm_id() {
        let cfg = Config::parse_from(["rfclient", "-n", "0xaabbccddeeff"]);
        assert_eq!(cfg.vm_id, Some(0xaabbccddeeff));
    }

    #[test]
    fn parses_fpm_flag_and_overrides() {
        let cfg = Config::parse_from(["rfclient", "-f", "-a", "10.0.0.1:9999", "-i", "eth1"]);
        assert!(cfg.fpm);
        assert_eq!(cfg.ipc_address, "10.0.0.1:9999");
        assert_eq!(cfg.interface, "eth1");
    }

    #[test]
    fn rejects_unknown_flag() {
        let result = Config::try_parse_from(["rfclient", "--bogus"]);
        assert!(result.is_err());
    }
}
