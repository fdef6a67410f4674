//! Observed characters to 0/1 indicator vectors.
//!
//! Ambiguity codes set several entries to 1; gaps and unknowns set all of
//! them.

use sylva_core::{Result, SylvaError};

use crate::empirical::{AMINO_ACIDS, AA_STATES};

/// Number of nucleotide states.
pub const NUCLEOTIDE_STATES: usize = 4;

/// How alignment bytes map to states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum StateCoding {
    /// A, C, G, T/U with IUPAC ambiguity codes.
    Nucleotide,
    /// The 20 amino acids with B, Z, J and X ambiguity.
    AminoAcid,
}

impl StateCoding {
    pub fn n_states(self) -> usize {
        match self {
            Self::Nucleotide => NUCLEOTIDE_STATES,
            Self::AminoAcid => AA_STATES,
        }
    }

    /// Indicator vector for one alignment byte.
    pub fn partial(self, symbol: u8) -> Result<Vec<f64>> {
        match self {
            Self::Nucleotide => nucleotide_partial(symbol),
            Self::AminoAcid => amino_acid_partial(symbol),
        }
    }
}

/// Map a nucleotide byte to an index (A=0, C=1, G=2, T=3).
///
/// Accepts both upper and lower case. Returns `None` for anything that is
/// not a single unambiguous base.
pub fn nucleotide_index(b: u8) -> Option<usize> {
    match b.to_ascii_uppercase() {
        b'A' => Some(0),
        b'C' => Some(1),
        b'G' => Some(2),
        b'T' | b'U' => Some(3),
        _ => None,
    }
}

/// Indicator vector over A, C, G, T for a nucleotide or IUPAC code.
pub fn nucleotide_partial(b: u8) -> Result<Vec<f64>> {
    let members: &[usize] = match b.to_ascii_uppercase() {
        b'A' => &[0],
        b'C' => &[1],
        b'G' => &[2],
        b'T' | b'U' => &[3],
        b'R' => &[0, 2],
        b'Y' => &[1, 3],
        b'S' => &[1, 2],
        b'W' => &[0, 3],
        b'K' => &[2, 3],
        b'M' => &[0, 1],
        b'B' => &[1, 2, 3],
        b'D' => &[0, 2, 3],
        b'H' => &[0, 1, 3],
        b'V' => &[0, 1, 2],
        b'N' | b'-' | b'?' | b'.' => &[0, 1, 2, 3],
        other => {
            return Err(SylvaError::InvalidInput(format!(
                "unrecognized nucleotide symbol '{}'",
                other as char
            )))
        }
    };
    Ok(indicator(NUCLEOTIDE_STATES, members))
}

/// Indicator vector over the 20 amino acids in `ARNDCQEGHILKMFPSTWYV`
/// order.
pub fn amino_acid_partial(b: u8) -> Result<Vec<f64>> {
    let upper = b.to_ascii_uppercase();
    if let Some(idx) = AMINO_ACIDS.iter().position(|&aa| aa == upper) {
        return Ok(indicator(AA_STATES, &[idx]));
    }
    let pair = match upper {
        b'B' => [b'N', b'D'],
        b'Z' => [b'Q', b'E'],
        b'J' => [b'I', b'L'],
        b'X' | b'-' | b'?' | b'.' => return Ok(vec![1.0; AA_STATES]),
        other => {
            return Err(SylvaError::InvalidInput(format!(
                "unrecognized amino acid symbol '{}'",
                other as char
            )))
        }
    };
    let members: Vec<usize> = pair
        .iter()
        .filter_map(|&aa| AMINO_ACIDS.iter().position(|&c| c == aa))
        .collect();
    Ok(indicator(AA_STATES, &members))
}

/// Indicator vector for an integer-coded discrete trait.
///
/// Accepts a single state (`"2"`), a polymorphism joined by `&` or `/`
/// (`"0&1"`), or `?`/`-` for missing data.
pub fn discrete_partial(token: &str, n_states: usize) -> Result<Vec<f64>> {
    let token = token.trim();
    if token == "?" || token == "-" {
        return Ok(vec![1.0; n_states]);
    }
    let mut members = Vec::new();
    for part in token.split(|c| c == '&' || c == '/') {
        let state: usize = part.trim().parse().map_err(|_| {
            SylvaError::InvalidInput(format!("unrecognized trait state '{}'", part))
        })?;
        if state >= n_states {
            return Err(SylvaError::InvalidInput(format!(
                "trait state {} out of range for {} states",
                state, n_states
            )));
        }
        members.push(state);
    }
    Ok(indicator(n_states, &members))
}

fn indicator(n: usize, members: &[usize]) -> Vec<f64> {
    let mut v = vec![0.0; n];
    for &m in members {
        v[m] = 1.0;
    }
    v
}
