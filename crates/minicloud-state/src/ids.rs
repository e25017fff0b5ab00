//! Random identifiers and names.

use crate::error::{ClusterError, ClusterResult};

const LOWER_ALNUM: &[u8] = b"abcdefghijklmnopqrstuvwxyz0123456789";
const MIXED_ALNUM: &[u8] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz0123456789";

/// Random lowercase alphanumeric string, used for pod ids.
pub fn random_id(len: usize) -> ClusterResult<String> {
    random_from(LOWER_ALNUM, len)
}

/// Name for a server node created by the elasticity machinery.
pub fn auto_node_name() -> ClusterResult<String> {
    Ok(format!("auto-{}", random_from(MIXED_ALNUM, 8)?))
}

fn random_from(alphabet: &[u8], len: usize) -> ClusterResult<String> {
    let mut buf = vec![0u8; len];
    getrandom::getrandom(&mut buf)
        .map_err(|e| ClusterError::Entropy(format!("getrandom failed: {e}")))?;
    Ok(buf
        .iter()
        .map(|b| alphabet[*b as usize % alphabet.len()] as char)
        .collect())
}
