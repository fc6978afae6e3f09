//! Query parameter checks run before anything is sent

use meshquery_core::{Command, RouterError, RouterResult};

const BASE58_ALPHABET: &str = "123456789ABCDEFGHJKLMNPQRSTUVWXYZabcdefghijkmnopqrstuvwxyz";

/// Replies waited for when neither the caller nor the config says otherwise
pub const DEFAULT_CONFIRMATIONS: usize = 1;

pub fn is_number(s: &str) -> bool {
    !s.is_empty() && s.bytes().all(|b| b.is_ascii_digit())
}

pub fn is_hash(s: &str) -> bool {
    !s.is_empty() && s.bytes().all(|b| b.is_ascii_hexdigit())
}

/// Base58 string of plausible address length
pub fn is_address(s: &str) -> bool {
    (26..=35).contains(&s.len()) && s.chars().all(|c| BASE58_ALPHABET.contains(c))
}

fn invalid(what: &str, value: &str) -> RouterError {
    RouterError::InvalidParameters(format!("Incorrect {}: {}", what, value))
}

/// Check the positional parameters of `command`
pub fn validate_params(command: Command, param1: &str, param2: &str) -> RouterResult<()> {
    match command {
        Command::GetBlockHash | Command::GetAllBlocks if !is_number(param1) => {
            return Err(invalid("block number", param1));
        }
        Command::GetTransactionsBloomFilter if !is_hash(param1) || param1.len() % 10 != 0 => {
            return Err(invalid("bloom filter", param1));
        }
        Command::GetBlock | Command::GetTransaction if !is_hash(param1) => {
            return Err(invalid("hash", param1));
        }
        Command::GetAllTransactions | Command::GetBalanceUpdate if !is_address(param1) => {
            return Err(invalid("address", param1));
        }
        _ => {}
    }

    match command {
        Command::GetAllTransactions
        | Command::GetBalanceUpdate
        | Command::GetTransactionsBloomFilter
            if !is_number(param2) =>
        {
            Err(invalid("block number", param2))
        }
        _ => Ok(()),
    }
}

/// Number of replies to wait for: the caller's choice, else the configured
/// default, else one
pub fn resolve_confirmations(explicit: Option<u32>, configured: u32) -> RouterResult<usize> {
    match explicit {
        Some(0) => Err(RouterError::InvalidParameters(
            "Incorrect number of providers for consensus: 0".to_string(),
        )),
        Some(n) => Ok(n as usize),
        None if configured > 0 => Ok(configured as usize),
        None => Ok(DEFAULT_CONFIRMATIONS),
    }
}
