use std::path::PathBuf;
use std::time::Duration;

use crate::error::{LedgerError, LedgerResult};
use crate::models::Address;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LedgerMode {
    Remote,
    Local,
}

/// Settings the controller is constructed with. Never mutated afterwards.
#[derive(Debug, Clone)]
pub struct ControllerConfig {
    pub network: String,
    pub allow_delegated: bool,
    pub allow_self_custodied: bool,
    /// funding-only mode: balance and deposits target this address
    pub funding_target: Option<Address>,
    pub auto_refresh: bool,
    pub refresh_interval: Duration,
    pub deposit_settle_delay: Duration,
    pub notice_duration: Duration,
    pub pulse_duration: Duration,
    pub countdown_tick: Duration,
    pub call_timeout: Option<Duration>,
    pub token_decimals: u32,
    pub token_symbol: String,
}

impl ControllerConfig {
    pub fn new(network: impl Into<String>) -> Self {
        Self {
            network: network.into(),
            allow_delegated: true,
            allow_self_custodied: true,
            funding_target: None,
            auto_refresh: true,
            refresh_interval: Duration::from_secs(30),
            deposit_settle_delay: Duration::from_secs(2),
            notice_duration: Duration::from_secs(5),
            pulse_duration: Duration::from_secs(3),
            countdown_tick: Duration::from_secs(1),
            call_timeout: Some(Duration::from_secs(30)),
            token_decimals: 18,
            token_symbol: "ETH".into(),
        }
    }

    pub fn validate(&self) -> LedgerResult<()> {
        if self.network.trim().is_empty() {
            return Err(LedgerError::configuration("network is not set"));
        }
        if !self.allow_delegated && !self.allow_self_custodied {
            return Err(LedgerError::configuration("every account source is disabled"));
        }
        if self.refresh_interval.is_zero() {
            return Err(LedgerError::configuration("balance refresh interval must be non-zero"));
        }
        if self.token_decimals > 38 {
            return Err(LedgerError::configuration("token decimals must be at most 38"));
        }
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub controller: ControllerConfig,
    pub ledger_mode: LedgerMode,
    pub ledger_service_url: String,
    pub derivation_service_url: String,
    /// security delay of the in-process ledger
    pub local_withdraw_delay: Duration,
    pub data_dir: PathBuf,
    pub port: u16,
    pub log_json: bool,
}

impl AppConfig {
    pub fn from_env() -> LedgerResult<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> LedgerResult<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());

        let network = get("LEDGER_NETWORK")
            .ok_or_else(|| LedgerError::configuration("LEDGER_NETWORK must be set"))?;

        let mut controller = ControllerConfig::new(network);
        controller.allow_delegated = parse_bool(&get, "ALLOW_DELEGATED", true)?;
        controller.allow_self_custodied = parse_bool(&get, "ALLOW_SELF_CUSTODIED", true)?;
        controller.funding_target = get("FUNDING_TARGET")
            .map(|v| Address::parse(&v))
            .transpose()?;
        controller.auto_refresh = parse_bool(&get, "AUTO_REFRESH", true)?;
        controller.refresh_interval = parse_millis(&get, "BALANCE_REFRESH_MS", 30_000)?;
        controller.deposit_settle_delay = parse_millis(&get, "DEPOSIT_SETTLE_MS", 2_000)?;
        controller.notice_duration = parse_millis(&get, "NOTICE_CLEAR_MS", 5_000)?;
        controller.pulse_duration = parse_millis(&get, "PULSE_MS", 3_000)?;
        controller.countdown_tick = parse_millis(&get, "COUNTDOWN_TICK_MS", 1_000)?;
        let timeout = parse_millis(&get, "LEDGER_CALL_TIMEOUT_MS", 30_000)?;
        controller.call_timeout = (!timeout.is_zero()).then_some(timeout);
        controller.token_decimals = parse_num(&get, "TOKEN_DECIMALS", 18u32)?;
        controller.token_symbol = get("TOKEN_SYMBOL").unwrap_or_else(|| "ETH".into());
        controller.validate()?;

        let ledger_mode = match get("LEDGER_MODE").as_deref() {
            None | Some("remote") => LedgerMode::Remote,
            Some("local") => LedgerMode::Local,
            Some(other) => {
                return Err(LedgerError::configuration(format!("unknown LEDGER_MODE {}", other)))
            }
        };

        Ok(Self {
            controller,
            ledger_mode,
            ledger_service_url: get("LEDGER_SERVICE_URL")
                .unwrap_or_else(|| "http://localhost:8545".into()),
            derivation_service_url: get("DERIVATION_SERVICE_URL")
                .unwrap_or_else(|| "http://localhost:7070".into()),
            local_withdraw_delay: Duration::from_secs(parse_num(&get, "LOCAL_WITHDRAW_DELAY_SECS", 3600u64)?),
            data_dir: PathBuf::from(get("DATA_DIR").unwrap_or_else(|| "./data".into())),
            port: parse_num(&get, "PORT", 3000u16)?,
            log_json: parse_bool(&get, "LEDGER_LOG_JSON", false)?,
        })
    }
}

fn parse_bool<G: Fn(&str) -> Option<String>>(get: &G, key: &str, default: bool) -> LedgerResult<bool> {
    match get(key) {
        None => Ok(default),
        Some(v) => match v.to_ascii_lowercase().as_str() {
            "1" | "true" | "yes" | "on" => Ok(true),
            "0" | "false" | "no" | "off" => Ok(false),
            _ => Err(LedgerError::configuration(format!("{} must be a boolean, got {}", key, v))),
        },
    }
}

fn parse_num<G, T>(get: &G, key: &str, default: T) -> LedgerResult<T>
where
    G: Fn(&str) -> Option<String>,
    T: std::str::FromStr,
{
    match get(key) {
        None => Ok(default),
        Some(v) => v
            .parse::<T>()
            .map_err(|_| LedgerError::configuration(format!("{} must be a number, got {}", key, v))),
    }
}

fn parse_millis<G: Fn(&str) -> Option<String>>(get: &G, key: &str, default: u64) -> LedgerResult<Duration> {
    parse_num(get, key, default).map(Duration::from_millis)
}
