use crate::config::Config;
use crate::query::formatters::{OutputFormat, format_refunded, format_summary};
use crate::repository::{AmountRepository, CursorRepository, RefundedRepository};
use alloy_primitives::{Address, U256};
use anyhow::Result;
use tracing::info;

/// What the ledger files currently hold. `None` means the service is not
/// configured or its file has not been created yet.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LedgerSummary {
    pub cursor: Option<u64>,
    pub refunded_wei: Option<U256>,
    pub refunded_count: Option<usize>,
    pub gave_wei: Option<U256>,
}

/// Reads without creating anything.
pub fn read_summary(config: &Config) -> Result<LedgerSummary> {
    let mut summary = LedgerSummary::default();

    if let Some(gasfee) = &config.gasfee_service {
        summary.cursor = CursorRepository::new(&gasfee.current_block_number_filepath).load()?;
        summary.refunded_wei = AmountRepository::new(&gasfee.refunded_wei_filepath).load()?;
        summary.refunded_count = RefundedRepository::new(&gasfee.refunded_list_filepath)
            .load()?
            .map(|refunded| refunded.len());
    }
    if let Some(giveaway) = &config.giveaway_service {
        summary.gave_wei = AmountRepository::new(&giveaway.current_gave_wei_filepath).load()?;
    }

    Ok(summary)
}

pub fn refunded_addresses(config: &Config) -> Result<Vec<Address>> {
    let Some(gasfee) = &config.gasfee_service else {
        anyhow::bail!("gasfee_service is not configured");
    };
    let mut addresses: Vec<Address> = RefundedRepository::new(&gasfee.refunded_list_filepath)
        .load()?
        .unwrap_or_default()
        .into_iter()
        .collect();
    addresses.sort();
    Ok(addresses)
}

/// Creates every missing ledger file with its initial value. Existing files
/// are left untouched.
pub fn init_ledger(config: &Config) -> Result<()> {
    if let Some(gasfee) = &config.gasfee_service {
        CursorRepository::new(&gasfee.current_block_number_filepath)
            .load_or_init(gasfee.refunder_start_block_number)?;
        AmountRepository::new(&gasfee.refunded_wei_filepath).load_or_init()?;
        RefundedRepository::new(&gasfee.refunded_list_filepath).load_or_init()?;
        info!("Gas refund ledger ready");
    }
    if let Some(giveaway) = &config.giveaway_service {
        AmountRepository::new(&giveaway.current_gave_wei_filepath).load_or_init()?;
        info!("Giveaway ledger ready");
    }
    Ok(())
}

pub fn cmd_show(config: &Config, format: &OutputFormat) -> Result<()> {
    let summary = read_summary(config)?;
    let output = format_summary(&summary, format);
    println!("{output}");

    Ok(())
}

pub fn cmd_refunded(config: &Config, format: &OutputFormat) -> Result<()> {
    let addresses = refunded_addresses(config)?;
    let output = format_refunded(&addresses, format);
    println!("{output}");

    Ok(())
}

pub fn cmd_init(config: &Config, format: &OutputFormat) -> Result<()> {
    init_ledger(config)?;
    cmd_show(config, format)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SAMPLE;
    use tempfile::TempDir;

    fn config_in(dir: &TempDir) -> Config {
        let mut config = Config::from_json(SAMPLE).unwrap();
        let gasfee = config.gasfee_service.as_mut().unwrap();
        gasfee.refunder_start_block_number = 777;
        gasfee.current_block_number_filepath = dir.path().join("current_block_number");
        gasfee.refunded_wei_filepath = dir.path().join("refunded_wei");
        gasfee.refunded_list_filepath = dir.path().join("refunded_list.json");
        config.giveaway_service.as_mut().unwrap().current_gave_wei_filepath =
            dir.path().join("current_gave_wei");
        config
    }

    #[test]
    fn summary_of_fresh_directory_is_empty_and_creates_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let config = config_in(&dir);

        assert_eq!(read_summary(&config).unwrap(), LedgerSummary::default());
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
    }

    #[test]
    fn init_writes_initial_values_once() {
        let dir = tempfile::tempdir().unwrap();
        let config = config_in(&dir);

        init_ledger(&config).unwrap();
        let summary = read_summary(&config).unwrap();
        assert_eq!(summary.cursor, Some(777));
        assert_eq!(summary.refunded_wei, Some(U256::ZERO));
        assert_eq!(summary.refunded_count, Some(0));
        assert_eq!(summary.gave_wei, Some(U256::ZERO));

        CursorRepository::new(dir.path().join("current_block_number"))
            .store(900)
            .unwrap();
        init_ledger(&config).unwrap();
        assert_eq!(read_summary(&config).unwrap().cursor, Some(900));
    }

    #[test]
    fn lists_refunded_addresses_sorted() {
        let dir = tempfile::tempdir().unwrap();
        let config = config_in(&dir);
        let refunded = std::collections::HashSet::from([
            Address::repeat_byte(9),
            Address::repeat_byte(1),
        ]);
        RefundedRepository::new(dir.path().join("refunded_list.json"))
            .store(&refunded)
            .unwrap();

        assert_eq!(
            refunded_addresses(&config).unwrap(),
            vec![Address::repeat_byte(1), Address::repeat_byte(9)]
        );
    }
}
