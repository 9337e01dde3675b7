//! Parsers for `nvidia-smi` CSV output
//!
//! Inventory query: `nvidia-smi --query-gpu=index --format=csv,noheader`
//! prints one decimal GPU index per line.
//!
//! Capacity query: `nvidia-smi -i <index> --query-gpu=memory.total --format=csv`
//! prints an optional `memory.total [MiB]` header followed by exactly one
//! `<integer> MiB` line.
//!
//! Anything else is a `ProbeParseError`.

use gpuledger_core::{LedgerError, LedgerResult};
use std::collections::BTreeSet;

/// MiB per ledger VRAM unit (GiB)
pub const MIB_PER_UNIT: u64 = 1024;

const MEMORY_HEADER: &str = "memory.total";

/// Parse the GPU index listing
pub fn parse_gpu_indices(output: &str) -> LedgerResult<Vec<u32>> {
    let mut seen = BTreeSet::new();
    let mut indices = Vec::new();

    for line in output.lines().map(str::trim).filter(|l| !l.is_empty()) {
        let index: u32 = line
            .parse()
            .map_err(|_| parse_err(format!("invalid GPU index line {:?}", line)))?;
        if !seen.insert(index) {
            return Err(parse_err(format!("duplicate GPU index {}", index)));
        }
        indices.push(index);
    }

    if indices.is_empty() {
        return Err(parse_err("empty GPU inventory".to_string()));
    }
    Ok(indices)
}

/// Parse a memory.total query, returning MiB
pub fn parse_memory_total_mib(output: &str) -> LedgerResult<u64> {
    let mut values = output
        .lines()
        .map(str::trim)
        .filter(|l| !l.is_empty())
        .skip_while(|l| l.starts_with(MEMORY_HEADER));

    let line = values
        .next()
        .ok_or_else(|| parse_err("missing memory.total value".to_string()))?;
    if let Some(extra) = values.next() {
        return Err(parse_err(format!("unexpected trailing line {:?}", extra)));
    }

    let (number, unit) = line
        .split_once(char::is_whitespace)
        .ok_or_else(|| parse_err(format!("memory value without unit: {:?}", line)))?;
    if unit.trim() != "MiB" {
        return Err(parse_err(format!("unsupported memory unit {:?}", unit.trim())));
    }

    number
        .parse()
        .map_err(|_| parse_err(format!("invalid memory value {:?}", number)))
}

/// Convert MiB to ledger units by floor division.
///
/// A slot smaller than one unit cannot hold any reservation and is rejected.
pub fn mib_to_units(mib: u64) -> LedgerResult<u64> {
    let units = mib / MIB_PER_UNIT;
    if units == 0 {
        return Err(parse_err(format!("GPU memory {} MiB is below one unit", mib)));
    }
    Ok(units)
}

fn parse_err(message: String) -> LedgerError {
    LedgerError::ProbeParseError(message)
}
