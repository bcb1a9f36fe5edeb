//! Site patterns: alignment columns compressed to unique patterns.
//!
//! States are stored per taxon. A value below `state_count` is an observed
//! state; `state_count` itself means unknown (gap or missing), and values
//! above it are ambiguity codes resolved through an ambiguity table.

use std::collections::HashMap;

use crate::error::{Error, Result};

const NUCLEOTIDE_STATES: usize = 4;

/// IUPAC codes beyond the four bases, in code order after "unknown".
const NUCLEOTIDE_AMBIGUITIES: [(char, &[usize]); 10] = [
    ('R', &[0, 2]),
    ('Y', &[1, 3]),
    ('M', &[0, 1]),
    ('K', &[2, 3]),
    ('S', &[1, 2]),
    ('W', &[0, 3]),
    ('H', &[0, 1, 3]),
    ('B', &[1, 2, 3]),
    ('V', &[0, 1, 2]),
    ('D', &[0, 2, 3]),
];

#[derive(Debug, Clone, PartialEq)]
pub struct Patterns {
    state_count: usize,
    taxa: Vec<String>,
    taxon_index: HashMap<String, usize>,
    states: Vec<Vec<u32>>,
    weights: Vec<f64>,
    ambiguity_sets: Vec<Vec<usize>>,
}

impl Patterns {
    /// Patterns given directly, one state vector per taxon.
    pub fn new(
        state_count: usize,
        taxa: Vec<String>,
        states: Vec<Vec<u32>>,
        weights: Vec<f64>,
    ) -> Result<Self> {
        let ambiguity_sets = vec![(0..state_count).collect()];
        Self::with_ambiguities(state_count, taxa, states, weights, ambiguity_sets)
    }

    fn with_ambiguities(
        state_count: usize,
        taxa: Vec<String>,
        states: Vec<Vec<u32>>,
        weights: Vec<f64>,
        ambiguity_sets: Vec<Vec<usize>>,
    ) -> Result<Self> {
        if state_count < 2 {
            return Err(Error::InvalidPatterns("need at least two states".to_string()));
        }
        if taxa.len() != states.len() {
            return Err(Error::InvalidPatterns(format!(
                "{} taxa but {} state rows",
                taxa.len(),
                states.len()
            )));
        }
        if let Some((taxon, row)) = taxa
            .iter()
            .zip(&states)
            .find(|(_, row)| row.len() != weights.len())
        {
            return Err(Error::InvalidPatterns(format!(
                "taxon '{}' has {} patterns, expected {}",
                taxon,
                row.len(),
                weights.len()
            )));
        }
        if weights.iter().any(|w| !(w.is_finite() && *w >= 0.0)) {
            return Err(Error::InvalidPatterns("pattern weights must be non-negative".to_string()));
        }
        let max_code = (state_count + ambiguity_sets.len()) as u32;
        if states.iter().flatten().any(|&s| s >= max_code) {
            return Err(Error::InvalidPatterns(format!(
                "state codes must be below {}",
                max_code
            )));
        }

        let mut taxon_index = HashMap::with_capacity(taxa.len());
        for (i, name) in taxa.iter().enumerate() {
            if taxon_index.insert(name.clone(), i).is_some() {
                return Err(Error::InvalidPatterns(format!("duplicate taxon '{}'", name)));
            }
        }

        Ok(Self {
            state_count,
            taxa,
            taxon_index,
            states,
            weights,
            ambiguity_sets,
        })
    }

    /// Compress aligned sequences (one per taxon) into unique patterns.
    pub fn from_alignment(
        state_count: usize,
        taxa: Vec<String>,
        sequences: Vec<Vec<u32>>,
    ) -> Result<Self> {
        let ambiguity_sets = vec![(0..state_count).collect()];
        Self::compress(state_count, taxa, sequences, ambiguity_sets)
    }

    /// Compress DNA sequences. `ACGTU` map to states, IUPAC codes to
    /// ambiguity sets, and anything else (`-`, `?`, `N`) to unknown.
    pub fn from_nucleotides(sequences: &[(&str, &str)]) -> Result<Self> {
        let taxa = sequences.iter().map(|(name, _)| name.to_string()).collect();
        let rows = sequences
            .iter()
            .map(|(_, seq)| seq.chars().map(nucleotide_code).collect())
            .collect();

        let mut ambiguity_sets: Vec<Vec<usize>> = vec![(0..NUCLEOTIDE_STATES).collect()];
        ambiguity_sets.extend(NUCLEOTIDE_AMBIGUITIES.iter().map(|(_, set)| set.to_vec()));

        Self::compress(NUCLEOTIDE_STATES, taxa, rows, ambiguity_sets)
    }

    fn compress(
        state_count: usize,
        taxa: Vec<String>,
        sequences: Vec<Vec<u32>>,
        ambiguity_sets: Vec<Vec<usize>>,
    ) -> Result<Self> {
        let site_count = sequences.first().map_or(0, Vec::len);
        if let Some((taxon, seq)) = taxa
            .iter()
            .zip(&sequences)
            .find(|(_, seq)| seq.len() != site_count)
        {
            return Err(Error::InvalidPatterns(format!(
                "sequence for '{}' has {} sites, expected {}",
                taxon,
                seq.len(),
                site_count
            )));
        }

        let mut seen: HashMap<Vec<u32>, usize> = HashMap::new();
        let mut columns: Vec<Vec<u32>> = Vec::new();
        let mut weights: Vec<f64> = Vec::new();
        for site in 0..site_count {
            let column: Vec<u32> = sequences.iter().map(|seq| seq[site]).collect();
            match seen.get(&column) {
                Some(&index) => weights[index] += 1.0,
                None => {
                    seen.insert(column.clone(), columns.len());
                    columns.push(column);
                    weights.push(1.0);
                }
            }
        }

        let states = (0..sequences.len())
            .map(|taxon| columns.iter().map(|column| column[taxon]).collect())
            .collect();

        Self::with_ambiguities(state_count, taxa, states, weights, ambiguity_sets)
    }

    pub fn state_count(&self) -> usize {
        self.state_count
    }

    pub fn pattern_count(&self) -> usize {
        self.weights.len()
    }

    pub fn taxon_count(&self) -> usize {
        self.taxa.len()
    }

    pub fn taxa(&self) -> &[String] {
        &self.taxa
    }

    pub fn taxon_index(&self, name: &str) -> Option<usize> {
        self.taxon_index.get(name).copied()
    }

    pub fn weights(&self) -> &[f64] {
        &self.weights
    }

    /// Number of alignment columns the patterns stand for.
    pub fn site_count(&self) -> f64 {
        self.weights.iter().sum()
    }

    /// Compact states for one taxon; any code `>= state_count` is unknown.
    pub fn tip_states(&self, taxon: usize) -> &[u32] {
        &self.states[taxon]
    }

    /// Partial likelihood vector (`pattern × state`) for one taxon, with
    /// ambiguity codes expanded.
    pub fn tip_partials(&self, taxon: usize) -> Vec<f64> {
        let mut partials = vec![0.0; self.pattern_count() * self.state_count];
        for (pattern, &code) in self.states[taxon].iter().enumerate() {
            let row = &mut partials[pattern * self.state_count..(pattern + 1) * self.state_count];
            let code = code as usize;
            if code < self.state_count {
                row[code] = 1.0;
            } else {
                for &state in &self.ambiguity_sets[code - self.state_count] {
                    row[state] = 1.0;
                }
            }
        }
        partials
    }

    /// Weighted state frequencies, spreading ambiguous observations evenly.
    pub fn empirical_frequencies(&self) -> Vec<f64> {
        let mut counts = vec![0.0; self.state_count];
        for row in &self.states {
            for (&code, &weight) in row.iter().zip(&self.weights) {
                let code = code as usize;
                if code < self.state_count {
                    counts[code] += weight;
                } else {
                    let set = &self.ambiguity_sets[code - self.state_count];
                    for &state in set {
                        counts[state] += weight / set.len() as f64;
                    }
                }
            }
        }
        let total: f64 = counts.iter().sum();
        if total > 0.0 {
            counts.iter_mut().for_each(|c| *c /= total);
        } else {
            counts.iter_mut().for_each(|c| *c = 1.0 / self.state_count as f64);
        }
        counts
    }
}

fn nucleotide_code(symbol: char) -> u32 {
    match symbol.to_ascii_uppercase() {
        'A' => 0,
        'C' => 1,
        'G' => 2,
        'T' | 'U' => 3,
        other => NUCLEOTIDE_AMBIGUITIES
            .iter()
            .position(|(code, _)| *code == other)
            .map_or(NUCLEOTIDE_STATES as u32, |k| (NUCLEOTIDE_STATES + 1 + k) as u32),
    }
}
