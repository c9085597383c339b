//! Block-structured text data files.
//!
//! A data file is a sequence of named blocks. A block starts with a
//! `# Name` line; everything up to the next `#` line is its payload. Cells
//! are whitespace-separated integers, with `-` as the dash ("any value")
//! glyph. The loader needs two blocks:
//!
//! ```text
//! # Ranges
//! <Q>
//! <Q minimum values>
//! <Q maximum values>
//! # LearningSet
//! <N> <Q> <R>
//! <Q feature cells> | <R label cells>      (N data lines)
//! ```
//!
//! Every input block, known or not, is preserved and transferred to the
//! output ahead of the result blocks, unless [`DataFile::reset`] drops them
//! (the driver's `--no-transfer` mode). Results are appended as:
//!
//! ```text
//! # IrredundantMatrix
//! <H> <Q>
//! <H rows>
//! # Weights
//! <Q>
//! <column weights>
//! ```

use std::io::{self, BufRead, Write};

use thiserror::Error;

use crate::dataset::{Dataset, DatasetError};
use crate::row::{DASH, Row};

#[derive(Debug, Error)]
pub enum DataFileError {
    #[error("line {line}: {message}")]
    Parse { line: usize, message: String },
    #[error("missing `# {0}` block")]
    MissingBlock(&'static str),
    #[error("line {line}: expected {expected} cells, found {found}")]
    CellCount {
        line: usize,
        expected: usize,
        found: usize,
    },
    #[error("learning set declares {declared} data rows, found {found}")]
    RowCount { declared: usize, found: usize },
    #[error("row {row}, column {column}: value {value} outside declared range [{min}, {max}]")]
    ValueOutOfRange {
        row: usize,
        column: usize,
        value: i32,
        min: i32,
        max: i32,
    },
    #[error("column {column}: minimum {min} exceeds maximum {max}")]
    EmptyRange { column: usize, min: i32, max: i32 },
    #[error(transparent)]
    Io(#[from] io::Error),
}

/// A parsed data file: the learning set plus the raw input blocks kept for
/// transfer, and optionally the computed result.
#[derive(Debug)]
pub struct DataFile {
    n: usize,
    q: usize,
    r: usize,
    features: Vec<i32>,
    labels: Vec<i32>,
    min: Vec<i32>,
    max: Vec<i32>,
    /// Input blocks in file order, as `(name, payload lines)`.
    transfer: Vec<(String, Vec<String>)>,
    result: Option<(Vec<Row>, Vec<i64>)>,
}

/// One payload line with its 1-based position in the file, for error
/// reporting.
struct Numbered {
    line: usize,
    text: String,
}

fn parse_cell(token: &str, line: usize) -> Result<i32, DataFileError> {
    if token == "-" {
        return Ok(DASH);
    }
    token.parse().map_err(|_| DataFileError::Parse {
        line,
        message: format!("invalid integer `{token}`"),
    })
}

fn parse_cells(text: &str, line: usize) -> Result<Vec<i32>, DataFileError> {
    text.split_whitespace()
        .map(|token| parse_cell(token, line))
        .collect()
}

fn expect_width(cells: Vec<i32>, expected: usize, line: usize) -> Result<Vec<i32>, DataFileError> {
    if cells.len() != expected {
        return Err(DataFileError::CellCount {
            line,
            expected,
            found: cells.len(),
        });
    }
    Ok(cells)
}

impl DataFile {
    pub fn load(reader: impl BufRead) -> Result<Self, DataFileError> {
        let mut blocks: Vec<(String, Vec<Numbered>)> = Vec::new();
        for (index, line) in reader.lines().enumerate() {
            let line_no = index + 1;
            let text = line?;
            if let Some(name) = text.strip_prefix('#') {
                blocks.push((name.trim().to_string(), Vec::new()));
            } else if text.trim().is_empty() {
                continue;
            } else {
                match blocks.last_mut() {
                    Some((_, payload)) => payload.push(Numbered {
                        line: line_no,
                        text,
                    }),
                    None => {
                        return Err(DataFileError::Parse {
                            line: line_no,
                            message: "content before the first `#` block header".to_string(),
                        });
                    }
                }
            }
        }

        let ranges = blocks
            .iter()
            .find(|(name, _)| name == "Ranges")
            .ok_or(DataFileError::MissingBlock("Ranges"))?;
        let (min, max) = Self::parse_ranges(&ranges.1)?;

        let learning = blocks
            .iter()
            .find(|(name, _)| name == "LearningSet")
            .ok_or(DataFileError::MissingBlock("LearningSet"))?;
        let (n, r, features, labels) = Self::parse_learning_set(&learning.1, &min, &max)?;

        let transfer = blocks
            .iter()
            .map(|(name, payload)| {
                (
                    name.clone(),
                    payload.iter().map(|l| l.text.clone()).collect(),
                )
            })
            .collect();

        Ok(Self {
            n,
            q: min.len(),
            r,
            features,
            labels,
            min,
            max,
            transfer,
            result: None,
        })
    }

    fn parse_ranges(payload: &[Numbered]) -> Result<(Vec<i32>, Vec<i32>), DataFileError> {
        let [header, min_line, max_line] = payload else {
            return Err(DataFileError::Parse {
                line: payload.first().map_or(0, |l| l.line),
                message: format!("`# Ranges` needs 3 payload lines, found {}", payload.len()),
            });
        };

        let q = parse_cell(header.text.trim(), header.line)? as usize;
        let min = expect_width(parse_cells(&min_line.text, min_line.line)?, q, min_line.line)?;
        let max = expect_width(parse_cells(&max_line.text, max_line.line)?, q, max_line.line)?;
        for (column, (&lo, &hi)) in min.iter().zip(&max).enumerate() {
            if lo > hi {
                return Err(DataFileError::EmptyRange {
                    column,
                    min: lo,
                    max: hi,
                });
            }
        }
        Ok((min, max))
    }

    fn parse_learning_set(
        payload: &[Numbered],
        min: &[i32],
        max: &[i32],
    ) -> Result<(usize, usize, Vec<i32>, Vec<i32>), DataFileError> {
        let Some((header, data)) = payload.split_first() else {
            return Err(DataFileError::Parse {
                line: 0,
                message: "`# LearningSet` block is empty".to_string(),
            });
        };
        let dims = parse_cells(&header.text, header.line)?;
        let [n, q, r] = dims[..] else {
            return Err(DataFileError::Parse {
                line: header.line,
                message: "learning-set header must be `N Q R`".to_string(),
            });
        };
        let (n, q, r) = (n as usize, q as usize, r as usize);
        if q != min.len() {
            return Err(DataFileError::Parse {
                line: header.line,
                message: format!(
                    "learning set declares {q} feature columns, ranges declare {}",
                    min.len()
                ),
            });
        }
        if data.len() != n {
            return Err(DataFileError::RowCount {
                declared: n,
                found: data.len(),
            });
        }

        let mut features = Vec::with_capacity(n * q);
        let mut labels = Vec::with_capacity(n * r);
        for (row, line) in data.iter().enumerate() {
            let Some((left, right)) = line.text.split_once('|') else {
                return Err(DataFileError::Parse {
                    line: line.line,
                    message: "data row must separate features and labels with `|`".to_string(),
                });
            };
            let feature_cells = expect_width(parse_cells(left, line.line)?, q, line.line)?;
            for (column, &value) in feature_cells.iter().enumerate() {
                if value != DASH && (value < min[column] || value > max[column]) {
                    return Err(DataFileError::ValueOutOfRange {
                        row,
                        column,
                        value,
                        min: min[column],
                        max: max[column],
                    });
                }
            }
            features.extend_from_slice(&feature_cells);
            labels.extend(expect_width(parse_cells(right, line.line)?, r, line.line)?);
        }

        Ok((n, r, features, labels))
    }

    /// Build the partitioned dataset for the sweep.
    pub fn to_dataset(&self) -> Result<Dataset, DatasetError> {
        Dataset::new(
            self.n,
            self.features.clone(),
            self.labels.clone(),
            self.min.clone(),
            self.max.clone(),
        )
    }

    pub fn len(&self) -> usize {
        self.n
    }

    pub fn is_empty(&self) -> bool {
        self.n == 0
    }

    pub fn feature_width(&self) -> usize {
        self.q
    }

    pub fn label_width(&self) -> usize {
        self.r
    }

    /// Drop the carried input blocks so that only result blocks are written.
    pub fn reset(&mut self) {
        self.transfer.clear();
    }

    /// Attach the computed result for serialization.
    pub fn set_result(&mut self, rows: Vec<Row>, weights: Vec<i64>) {
        self.result = Some((rows, weights));
    }

    /// Write the carried input blocks followed by the result blocks.
    pub fn save(&self, writer: &mut impl Write) -> io::Result<()> {
        for (name, payload) in &self.transfer {
            writeln!(writer, "# {name}")?;
            for line in payload {
                writeln!(writer, "{line}")?;
            }
        }

        if let Some((rows, weights)) = &self.result {
            writeln!(writer, "# IrredundantMatrix")?;
            writeln!(writer, "{} {}", rows.len(), self.q)?;
            for row in rows {
                writeln!(writer, "{row}")?;
            }

            writeln!(writer, "# Weights")?;
            writeln!(writer, "{}", weights.len())?;
            let rendered: Vec<String> = weights.iter().map(|w| w.to_string()).collect();
            writeln!(writer, "{}", rendered.join(" "))?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = "\
# Ranges
2
1 1
2 2
# LearningSet
3 2 1
1 2 | 0
2 1 | 1
- 2 | 0
";

    fn load(text: &str) -> Result<DataFile, DataFileError> {
        DataFile::load(text.as_bytes())
    }

    #[test]
    fn test_load_parses_ranges_and_learning_set() {
        let file = load(SAMPLE).unwrap();
        assert_eq!(file.len(), 3);
        assert_eq!(file.feature_width(), 2);
        assert_eq!(file.label_width(), 1);

        let set = file.to_dataset().unwrap();
        assert_eq!(set.class_count(), 2);
        assert_eq!(set.counts(), &[2, 1]);
    }

    #[test]
    fn test_dash_cells_parse_to_the_sentinel() {
        let file = load(SAMPLE).unwrap();
        assert_eq!(file.features[4], DASH);
    }

    #[test]
    fn test_save_transfers_input_and_appends_results() {
        let mut file = load(SAMPLE).unwrap();
        file.set_result(
            vec![Row::from_cells(vec![1, DASH])],
            vec![3, 4],
        );
        let mut out = Vec::new();
        file.save(&mut out).unwrap();
        let text = String::from_utf8(out).unwrap();

        assert!(text.starts_with("# Ranges\n"));
        assert!(text.contains("# LearningSet\n3 2 1\n"));
        assert!(text.contains("# IrredundantMatrix\n1 2\n1 -\n"));
        assert!(text.ends_with("# Weights\n2\n3 4\n"));
    }

    #[test]
    fn test_reset_drops_the_transferred_blocks() {
        let mut file = load(SAMPLE).unwrap();
        file.reset();
        file.set_result(vec![], vec![0, 0]);
        let mut out = Vec::new();
        file.save(&mut out).unwrap();
        let text = String::from_utf8(out).unwrap();
        assert!(text.starts_with("# IrredundantMatrix\n0 2\n"));
        assert!(!text.contains("# Ranges"));
    }

    #[test]
    fn test_unknown_blocks_are_preserved() {
        let text = format!("{SAMPLE}# Notes\nkeep me around\n");
        let mut file = load(&text).unwrap();
        file.set_result(vec![], vec![0, 0]);
        let mut out = Vec::new();
        file.save(&mut out).unwrap();
        assert!(String::from_utf8(out).unwrap().contains("# Notes\nkeep me around\n"));
    }

    #[test]
    fn test_round_trip_through_save_and_load() {
        let file = load(SAMPLE).unwrap();
        let mut out = Vec::new();
        file.save(&mut out).unwrap();
        let again = DataFile::load(&out[..]).unwrap();
        assert_eq!(again.features, file.features);
        assert_eq!(again.labels, file.labels);
        assert_eq!(again.min, file.min);
        assert_eq!(again.max, file.max);
    }

    #[test]
    fn test_missing_blocks_are_rejected() {
        assert!(matches!(
            load("# LearningSet\n1 1 1\n1 | 0\n"),
            Err(DataFileError::MissingBlock("Ranges"))
        ));
        assert!(matches!(
            load("# Ranges\n1\n0\n5\n"),
            Err(DataFileError::MissingBlock("LearningSet"))
        ));
    }

    #[test]
    fn test_dimension_mismatches_are_rejected() {
        // Three declared rows, two present.
        let text = "# Ranges\n2\n1 1\n2 2\n# LearningSet\n3 2 1\n1 2 | 0\n2 1 | 1\n";
        assert!(matches!(
            load(text),
            Err(DataFileError::RowCount {
                declared: 3,
                found: 2
            })
        ));

        // Row with too few feature cells.
        let text = "# Ranges\n2\n1 1\n2 2\n# LearningSet\n1 2 1\n1 | 0\n";
        assert!(matches!(load(text), Err(DataFileError::CellCount { .. })));
    }

    #[test]
    fn test_out_of_range_values_are_rejected() {
        let text = "# Ranges\n2\n1 1\n2 2\n# LearningSet\n1 2 1\n1 7 | 0\n";
        let err = load(text).unwrap_err();
        assert!(matches!(
            err,
            DataFileError::ValueOutOfRange {
                row: 0,
                column: 1,
                value: 7,
                ..
            }
        ));
    }

    #[test]
    fn test_inverted_range_is_rejected() {
        let text = "# Ranges\n1\n5\n1\n# LearningSet\n1 1 1\n3 | 0\n";
        assert!(matches!(load(text), Err(DataFileError::EmptyRange { .. })));
    }

    #[test]
    fn test_garbage_cells_are_rejected_with_the_line() {
        let text = "# Ranges\n2\n1 x\n2 2\n# LearningSet\n1 2 1\n1 2 | 0\n";
        match load(text) {
            Err(DataFileError::Parse { line, .. }) => assert_eq!(line, 3),
            other => panic!("expected parse error, got {other:?}"),
        }
    }
}
