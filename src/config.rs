//! Runtime configuration from environment variables
//!
//! Each socket-bearing subsystem reads its tuning knobs once, at first use.
//! The values are plain data; components receive their timeouts through
//! these snapshots and no other global state exists in the crate.

use std::time::Duration;

fn env_ms(name: &str, default: i64, min: i64) -> Duration {
    let val = std::env::var(name)
        .ok()
        .and_then(|v| v.trim().parse::<i64>().ok())
        .unwrap_or(default);

    if val < min {
        log::warn!("{}={} below minimum {}, clamping", name, val, min);
    }

    Duration::from_millis(val.max(min) as u64)
}

fn env_usize(name: &str, default: usize, min: usize, max: usize) -> usize {
    std::env::var(name)
        .ok()
        .and_then(|v| v.trim().parse::<usize>().ok())
        .unwrap_or(default)
        .max(min)
        .min(max)
}

fn env_flag(name: &str) -> bool {
    match std::env::var(name) {
        Ok(v) => {
            let v = v.trim();
            !v.is_empty() && v != "0" && !v.eq_ignore_ascii_case("false")
        }
        Err(_) => false,
    }
}

/// GATT handler tuning
///
/// * `gatt.cmd.read.timeout` - read reply deadline floor, >= 550ms
/// * `gatt.cmd.write.timeout` - write reply deadline floor, >= 550ms
/// * `gatt.cmd.init.timeout` - initial connect reply deadline floor, >= 2000ms
/// * `gatt.ringsize` - ATT reply ring capacity
/// * `debug.gatt.data` - log every ATT PDU moved over the bearer
pub struct GattEnv {
    pub read_cmd_reply_timeout: Duration,
    pub write_cmd_reply_timeout: Duration,
    pub initial_cmd_reply_timeout: Duration,
    pub attpdu_ring_capacity: usize,
    pub debug_data: bool,
}

impl GattEnv {
    fn from_env() -> Self {
        GattEnv {
            read_cmd_reply_timeout: env_ms("gatt.cmd.read.timeout", 550, 550),
            write_cmd_reply_timeout: env_ms("gatt.cmd.write.timeout", 550, 550),
            initial_cmd_reply_timeout: env_ms("gatt.cmd.init.timeout", 2500, 2000),
            attpdu_ring_capacity: env_usize("gatt.ringsize", 128, 1, 4096),
            debug_data: env_flag("debug.gatt.data"),
        }
    }

    pub fn get() -> &'static GattEnv {
        &GATT_ENV
    }
}

/// Mgmt dispatcher tuning
///
/// * `mgmt.reader.timeout` - reader thread poll interval
/// * `mgmt.cmd.timeout` - command reply deadline
/// * `mgmt.ringsize` - reply ring capacity, clamped to [64, 1024]
/// * `mgmt.btmode` - default adapter mode, one of DUAL, BREDR, LE
/// * `debug.mgmt.event` - log every received mgmt event
pub struct MgmtEnv {
    pub reader_poll_timeout: Duration,
    pub command_reply_timeout: Duration,
    pub evt_ring_capacity: usize,
    pub default_btmode: crate::mgmt::BtMode,
    pub debug_event: bool,
}

impl MgmtEnv {
    fn from_env() -> Self {
        let default_btmode = match std::env::var("mgmt.btmode").ok().as_ref().map(|s| s.trim()) {
            Some(s) if s.eq_ignore_ascii_case("DUAL") => crate::mgmt::BtMode::Dual,
            Some(s) if s.eq_ignore_ascii_case("BREDR") => crate::mgmt::BtMode::BrEdr,
            Some(s) if s.eq_ignore_ascii_case("LE") => crate::mgmt::BtMode::Le,
            Some(s) => {
                log::warn!("mgmt.btmode='{}' not one of DUAL, BREDR, LE; using LE", s);
                crate::mgmt::BtMode::Le
            }
            None => crate::mgmt::BtMode::Le,
        };

        MgmtEnv {
            reader_poll_timeout: env_ms("mgmt.reader.timeout", 10_000, 100),
            command_reply_timeout: env_ms("mgmt.cmd.timeout", 3_000, 100),
            evt_ring_capacity: env_usize("mgmt.ringsize", 64, 64, 1024),
            default_btmode,
            debug_event: env_flag("debug.mgmt.event"),
        }
    }

    pub fn get() -> &'static MgmtEnv {
        &MGMT_ENV
    }
}

lazy_static::lazy_static! {
    static ref GATT_ENV: GattEnv = GattEnv::from_env();
    static ref MGMT_ENV: MgmtEnv = MgmtEnv::from_env();
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn defaults_without_environment() {
        // The test runner is not expected to set any of these
        let gatt = GattEnv::get();

        assert!(gatt.read_cmd_reply_timeout >= Duration::from_millis(550));
        assert!(gatt.write_cmd_reply_timeout >= Duration::from_millis(550));
        assert!(gatt.initial_cmd_reply_timeout >= Duration::from_millis(2000));
        assert!(gatt.attpdu_ring_capacity >= 1);

        let mgmt = MgmtEnv::get();

        assert!(mgmt.evt_ring_capacity >= 64 && mgmt.evt_ring_capacity <= 1024);
    }
}
