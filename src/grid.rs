//! Frequency-grid regularisation.
//!
//! The concatenation tool assumes its inputs sit on a regular frequency
//! axis. Subband datasets routinely arrive with gaps (missing subbands), so
//! before concatenating we sort the datasets by frequency and insert
//! placeholder entries where subbands are missing; the tool is told to
//! tolerate the missing data.

use std::path::PathBuf;

use log::{debug, info};
use vec1::Vec1;

/// One subband's worth of visibility data. Read-only input to correction;
/// correcting a dataset always produces a new one under a new name.
#[derive(Debug, Clone, PartialEq)]
pub struct Dataset {
    /// File name relative to the stage's working directory.
    pub path: PathBuf,

    /// The representative frequency of the subband \[Hz\]. Unreliable after
    /// an upstream frequency split, which leaves every dataset reporting the
    /// same value.
    pub ref_freq_hz: f64,

    /// The frequency of the first channel \[Hz\], used as a fallback ordering
    /// key when the representative frequency is degenerate.
    pub chan_freq_hz: f64,
}

/// An entry of the regularised sequence handed to the concatenation tool.
#[derive(Debug, Clone, PartialEq)]
pub enum GridEntry {
    Real(Dataset),
    /// A synthetic dataset with no backing data, present only to keep the
    /// frequency axis regular. The index numbers placeholders sequentially
    /// across the whole sequence.
    Placeholder { index: usize },
}

impl GridEntry {
    pub fn name(&self) -> String {
        match self {
            GridEntry::Real(ds) => ds.path.display().to_string(),
            GridEntry::Placeholder { index } => format!("dummy{index}.ms"),
        }
    }
}

/// Order `datasets` by frequency and insert placeholders so that consecutive
/// entries are equally spaced.
///
/// The number of placeholders between two real datasets is
/// `round(gap / min_gap) - 1`, where `min_gap` is the smallest positive
/// frequency gap observed. A single dataset passes through unchanged. Equal
/// frequencies produce no placeholders and keep their input order (stable
/// sort); that degenerate case is accepted, not an error.
pub fn regularise(datasets: Vec1<Dataset>) -> Vec<GridEntry> {
    let mut datasets = datasets.into_vec();
    if datasets.len() == 1 {
        return datasets.drain(..).map(GridEntry::Real).collect();
    }

    // Any duplicated representative frequency means the field is unreliable;
    // fail over to the first-channel frequency and start again.
    let degenerate = {
        let mut freqs: Vec<f64> = datasets.iter().map(|ds| ds.ref_freq_hz).collect();
        freqs.sort_by(f64::total_cmp);
        freqs.windows(2).any(|w| w[1] - w[0] == 0.0)
    };
    let key: fn(&Dataset) -> f64 = if degenerate {
        info!("Representative frequencies are degenerate; ordering by first-channel frequency");
        |ds| ds.chan_freq_hz
    } else {
        |ds| ds.ref_freq_hz
    };

    datasets.sort_by(|a, b| key(a).total_cmp(&key(b)));
    let gaps: Vec<f64> = datasets.windows(2).map(|w| key(&w[1]) - key(&w[0])).collect();
    let min_gap = gaps
        .iter()
        .copied()
        .filter(|&gap| gap > 0.0)
        .fold(f64::INFINITY, f64::min);

    let mut entries = Vec::with_capacity(datasets.len());
    let mut num_placeholders = 0;
    for (i, ds) in datasets.into_iter().enumerate() {
        // The lowest-frequency dataset always anchors the grid.
        if i > 0 && min_gap.is_finite() {
            let missing = (gaps[i - 1] / min_gap).round() as i64 - 1;
            for _ in 0..missing.max(0) {
                debug!("Added placeholder: dummy{num_placeholders}.ms");
                entries.push(GridEntry::Placeholder {
                    index: num_placeholders,
                });
                num_placeholders += 1;
            }
        }
        entries.push(GridEntry::Real(ds));
    }

    if num_placeholders > 0 {
        info!("Inserted {num_placeholders} placeholder datasets to keep a regular frequency grid");
    }
    entries
}

#[cfg(test)]
mod tests {
    use super::*;
    use vec1::vec1;

    fn ds(name: &str, ref_mhz: f64) -> Dataset {
        Dataset {
            path: PathBuf::from(name),
            ref_freq_hz: ref_mhz * 1e6,
            chan_freq_hz: ref_mhz * 1e6,
        }
    }

    fn real_names(entries: &[GridEntry]) -> Vec<String> {
        entries
            .iter()
            .filter(|e| matches!(e, GridEntry::Real(_)))
            .map(|e| e.name())
            .collect()
    }

    #[test]
    fn single_dataset_is_identity() {
        let input = vec1![ds("only.ms", 100.0)];
        let out = regularise(input.clone());
        assert_eq!(out, vec![GridEntry::Real(input.first().clone())]);
    }

    #[test]
    fn regular_grid_gets_no_placeholders() {
        let out = regularise(vec1![ds("a.ms", 102.0), ds("b.ms", 100.0), ds("c.ms", 101.0)]);
        assert_eq!(
            out.iter().map(|e| e.name()).collect::<Vec<_>>(),
            vec!["b.ms", "c.ms", "a.ms"]
        );
    }

    #[test]
    fn gap_of_two_units_gets_one_placeholder() {
        // The end-to-end example: [100, 101, 103] MHz, min gap 1 MHz.
        let out = regularise(vec1![ds("d100.ms", 100.0), ds("d101.ms", 101.0), ds("d103.ms", 103.0)]);
        assert_eq!(
            out,
            vec![
                GridEntry::Real(ds("d100.ms", 100.0)),
                GridEntry::Real(ds("d101.ms", 101.0)),
                GridEntry::Placeholder { index: 0 },
                GridEntry::Real(ds("d103.ms", 103.0)),
            ]
        );
    }

    #[test]
    fn placeholder_numbering_is_global() {
        let out = regularise(vec1![
            ds("a.ms", 100.0),
            ds("b.ms", 102.0),
            ds("c.ms", 103.0),
            ds("d.ms", 106.0),
        ]);
        let names: Vec<String> = out.iter().map(|e| e.name()).collect();
        assert_eq!(
            names,
            vec!["a.ms", "dummy0.ms", "b.ms", "c.ms", "dummy1.ms", "dummy2.ms", "d.ms"]
        );
    }

    #[test]
    fn real_entries_preserve_the_input_set_in_ascending_order() {
        let input = vec1![
            ds("e.ms", 140.0),
            ds("a.ms", 100.0),
            ds("c.ms", 120.0),
            ds("b.ms", 110.0),
            ds("d.ms", 130.0),
        ];
        let out = regularise(input);
        assert_eq!(
            real_names(&out),
            vec!["a.ms", "b.ms", "c.ms", "d.ms", "e.ms"]
        );
    }

    #[test]
    fn determinism() {
        let input = vec1![ds("a.ms", 100.0), ds("b.ms", 105.0), ds("c.ms", 101.0)];
        assert_eq!(regularise(input.clone()), regularise(input));
    }

    #[test]
    fn degenerate_ref_freq_falls_back_to_channel_freq() {
        let split = |name: &str, chan_mhz: f64| Dataset {
            path: PathBuf::from(name),
            // A frequency split leaves every dataset with the same
            // representative frequency.
            ref_freq_hz: 100.0e6,
            chan_freq_hz: chan_mhz * 1e6,
        };
        let out = regularise(vec1![
            split("b.ms", 101.0),
            split("a.ms", 100.0),
            split("c.ms", 103.0),
        ]);
        let names: Vec<String> = out.iter().map(|e| e.name()).collect();
        assert_eq!(names, vec!["a.ms", "b.ms", "dummy0.ms", "c.ms"]);
    }

    #[test]
    fn equal_frequencies_are_a_tolerated_degenerate_case() {
        // Identical on both frequency fields: no placeholders, stable order,
        // no panic.
        let twin = |name: &str| Dataset {
            path: PathBuf::from(name),
            ref_freq_hz: 100.0e6,
            chan_freq_hz: 100.0e6,
        };
        let out = regularise(vec1![twin("first.ms"), twin("second.ms")]);
        assert_eq!(
            out.iter().map(|e| e.name()).collect::<Vec<_>>(),
            vec!["first.ms", "second.ms"]
        );
    }

    #[test]
    fn tie_plus_gap_clamps_negative_placeholder_counts() {
        // One zero gap amongst positive ones: the tie contributes no
        // placeholder, the real gap still gets filled.
        let chan = |name: &str, chan_mhz: f64| Dataset {
            path: PathBuf::from(name),
            ref_freq_hz: 100.0e6,
            chan_freq_hz: chan_mhz * 1e6,
        };
        let out = regularise(vec1![
            chan("a.ms", 100.0),
            chan("b.ms", 100.0),
            chan("c.ms", 102.0),
            chan("d.ms", 103.0),
        ]);
        let names: Vec<String> = out.iter().map(|e| e.name()).collect();
        assert_eq!(
            names,
            vec!["a.ms", "b.ms", "dummy0.ms", "c.ms", "d.ms"]
        );
    }
}
