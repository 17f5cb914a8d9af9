//! Metadata access for datasets and solution tables.
//!
//! Measurement sets and solution tables are only ever opened by external
//! tools; the handful of metadata fields the sequencer itself needs go
//! through the [`VisMetadata`] trait so that the table-reading collaborator
//! stays behind a seam.

use std::{
    path::{Path, PathBuf},
    process::Command,
};

use log::debug;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum MetadataError {
    #[error("Metadata query '{query}' on {path} failed: {reason}")]
    Query {
        query: String,
        path: PathBuf,
        reason: String,
    },

    #[error("Could not parse metadata output for '{query}' on {path}: {output:?}")]
    Parse {
        query: String,
        path: PathBuf,
        output: String,
    },
}

pub trait VisMetadata: Send + Sync {
    /// The representative frequency of a dataset \[Hz\].
    fn ref_frequency(&self, ms: &Path) -> Result<f64, MetadataError>;

    /// The frequency of the first channel of a dataset \[Hz\].
    fn chan_frequency(&self, ms: &Path) -> Result<f64, MetadataError>;

    /// The first and last time sample of a dataset \[s\].
    fn time_range(&self, ms: &Path) -> Result<(f64, f64), MetadataError>;

    /// The names of all stations present in a dataset.
    fn station_names(&self, ms: &Path) -> Result<Vec<String>, MetadataError>;

    /// The observation field code of a dataset.
    fn field_code(&self, ms: &Path) -> Result<String, MetadataError>;

    /// The delay direction of a dataset's field as (ra, dec) \[radians\].
    fn delay_direction(&self, ms: &Path) -> Result<(f64, f64), MetadataError>;

    /// The station names required by the main solution table.
    fn solution_stations(&self, solutions: &Path) -> Result<Vec<String>, MetadataError>;
}

/// Stations in `ms` that the main solution table knows nothing about. These
/// must be filtered out of the dataset before calibration is applied.
pub fn missing_stations(
    metadata: &dyn VisMetadata,
    ms: &Path,
    solutions: &Path,
) -> Result<Vec<String>, MetadataError> {
    let known = metadata.solution_stations(solutions)?;
    Ok(metadata
        .station_names(ms)?
        .into_iter()
        .filter(|station| !known.contains(station))
        .collect())
}

/// [`VisMetadata`] backed by the `msinfo.py` helper script.
///
/// Argument contract: `python3 msinfo.py <query> <path>`, with the answer as
/// whitespace-separated values on stdout.
pub struct ScriptMetadata {
    script: PathBuf,
}

impl ScriptMetadata {
    pub fn new(helper_scripts: &Path) -> ScriptMetadata {
        ScriptMetadata {
            script: helper_scripts.join("msinfo.py"),
        }
    }

    fn query(&self, query: &str, path: &Path) -> Result<String, MetadataError> {
        debug!("Querying {query} on {}", path.display());
        let make_err = |reason: String| MetadataError::Query {
            query: query.to_string(),
            path: path.to_path_buf(),
            reason,
        };

        let output = Command::new("python3")
            .arg(&self.script)
            .arg(query)
            .arg(path)
            .output()
            .map_err(|e| make_err(e.to_string()))?;
        if !output.status.success() {
            return Err(make_err(format!(
                "exit status {}",
                output.status.code().unwrap_or(-1)
            )));
        }
        String::from_utf8(output.stdout).map_err(|e| make_err(e.to_string()))
    }

    fn query_floats(&self, query: &str, path: &Path, expected: usize) -> Result<Vec<f64>, MetadataError> {
        let output = self.query(query, path)?;
        let values = parse_floats(&output);
        if values.len() != expected {
            return Err(MetadataError::Parse {
                query: query.to_string(),
                path: path.to_path_buf(),
                output,
            });
        }
        Ok(values)
    }
}

impl VisMetadata for ScriptMetadata {
    fn ref_frequency(&self, ms: &Path) -> Result<f64, MetadataError> {
        Ok(self.query_floats("ref-freq", ms, 1)?[0])
    }

    fn chan_frequency(&self, ms: &Path) -> Result<f64, MetadataError> {
        Ok(self.query_floats("chan-freq", ms, 1)?[0])
    }

    fn time_range(&self, ms: &Path) -> Result<(f64, f64), MetadataError> {
        let values = self.query_floats("time-range", ms, 2)?;
        Ok((values[0], values[1]))
    }

    fn station_names(&self, ms: &Path) -> Result<Vec<String>, MetadataError> {
        Ok(parse_names(&self.query("stations", ms)?))
    }

    fn field_code(&self, ms: &Path) -> Result<String, MetadataError> {
        let output = self.query("field-code", ms)?;
        let code = output.trim();
        if code.is_empty() {
            return Err(MetadataError::Parse {
                query: "field-code".to_string(),
                path: ms.to_path_buf(),
                output,
            });
        }
        Ok(code.to_string())
    }

    fn delay_direction(&self, ms: &Path) -> Result<(f64, f64), MetadataError> {
        let values = self.query_floats("delay-dir", ms, 2)?;
        Ok((values[0], values[1]))
    }

    fn solution_stations(&self, solutions: &Path) -> Result<Vec<String>, MetadataError> {
        Ok(parse_names(&self.query("solution-stations", solutions)?))
    }
}

fn parse_floats(output: &str) -> Vec<f64> {
    output
        .split_whitespace()
        .filter_map(|token| token.parse().ok())
        .collect()
}

fn parse_names(output: &str) -> Vec<String> {
    output.split_whitespace().map(|s| s.to_string()).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn float_parsing_skips_junk() {
        assert_eq!(parse_floats("1.5e6  2.0e6\n"), vec![1.5e6, 2.0e6]);
        assert_eq!(parse_floats("nope 3.0"), vec![3.0]);
        assert!(parse_floats("").is_empty());
    }

    #[test]
    fn name_parsing() {
        assert_eq!(
            parse_names("CS001HBA0 CS002HBA0\nRS210HBA\n"),
            vec!["CS001HBA0", "CS002HBA0", "RS210HBA"]
        );
    }

    struct FakeMetadata {
        ms_stations: Vec<String>,
        h5_stations: Vec<String>,
    }

    impl VisMetadata for FakeMetadata {
        fn ref_frequency(&self, _: &Path) -> Result<f64, MetadataError> {
            unimplemented!()
        }
        fn chan_frequency(&self, _: &Path) -> Result<f64, MetadataError> {
            unimplemented!()
        }
        fn time_range(&self, _: &Path) -> Result<(f64, f64), MetadataError> {
            unimplemented!()
        }
        fn station_names(&self, _: &Path) -> Result<Vec<String>, MetadataError> {
            Ok(self.ms_stations.clone())
        }
        fn field_code(&self, _: &Path) -> Result<String, MetadataError> {
            unimplemented!()
        }
        fn delay_direction(&self, _: &Path) -> Result<(f64, f64), MetadataError> {
            unimplemented!()
        }
        fn solution_stations(&self, _: &Path) -> Result<Vec<String>, MetadataError> {
            Ok(self.h5_stations.clone())
        }
    }

    #[test]
    fn missing_stations_are_those_absent_from_the_solution_table() {
        let fake = FakeMetadata {
            ms_stations: vec!["CS001".to_string(), "CS002".to_string(), "DE601".to_string()],
            h5_stations: vec!["CS001".to_string(), "CS002".to_string()],
        };
        let missing =
            missing_stations(&fake, Path::new("a.ms"), Path::new("solutions.h5")).unwrap();
        assert_eq!(missing, vec!["DE601"]);
    }
}
