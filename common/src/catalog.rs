//! Static mapping from class identifiers to human-readable labels.
//!
use std::{
    collections::BTreeMap,
    fs::File,
    io::{self, BufRead},
    path::Path,
};

use thiserror::Error;

/// Errors raised while reading a catalog file.
#[derive(Error, Debug)]
pub enum CatalogError {
    #[error("failed to read catalog: {0}")]
    Io(#[from] io::Error),
    #[error("line {line}: expected `id,name`, got {content:?}")]
    Malformed { line: usize, content: String },
    #[error("line {line}: class id {id} is listed twice")]
    Duplicate { line: usize, id: i64 },
}

/// One catalog entry.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ClassLabel {
    pub id: i64,
    pub name: String,
}

/// Class id to label table, fixed at startup.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ClassCatalog {
    labels: BTreeMap<i64, ClassLabel>,
}

impl ClassCatalog {
    /// Build a catalog from `(id, name)` pairs. Later duplicates win.
    pub fn from_entries<'a>(entries: impl IntoIterator<Item = (i64, &'a str)>) -> Self {
        let labels = entries
            .into_iter()
            .map(|(id, name)| {
                (
                    id,
                    ClassLabel {
                        id,
                        name: name.to_owned(),
                    },
                )
            })
            .collect();
        Self { labels }
    }

    /// The catalog of the kangaroo detector graph.
    pub fn kangaroo() -> Self {
        Self::from_entries([(1, "Kangaroo"), (2, "Other")])
    }

    /// Read a catalog from a text file with one `id,name` entry per line.
    ///
    /// Empty lines and lines starting with `#` are ignored.
    pub fn from_labels_file(path: impl AsRef<Path>) -> Result<Self, CatalogError> {
        let reader = io::BufReader::new(File::open(path)?);
        let mut labels = BTreeMap::new();

        for (idx, line) in reader.lines().enumerate() {
            let line = line?;
            let line_no = idx + 1;
            let trimmed = line.trim();
            if trimmed.is_empty() || trimmed.starts_with('#') {
                continue;
            }

            let (id, name) = trimmed
                .split_once(',')
                .and_then(|(id, name)| {
                    let name = name.trim();
                    match (id.trim().parse::<i64>(), name.is_empty()) {
                        (Ok(id), false) => Some((id, name)),
                        _ => None,
                    }
                })
                .ok_or_else(|| CatalogError::Malformed {
                    line: line_no,
                    content: line.clone(),
                })?;

            let label = ClassLabel {
                id,
                name: name.to_owned(),
            };
            if labels.insert(id, label).is_some() {
                return Err(CatalogError::Duplicate { line: line_no, id });
            }
        }

        log::debug!("Loaded {} class labels", labels.len());

        Ok(Self { labels })
    }

    /// Look up a class id. Unknown ids yield `None`.
    pub fn get(&self, id: i64) -> Option<&ClassLabel> {
        self.labels.get(&id)
    }

    pub fn len(&self) -> usize {
        self.labels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.labels.is_empty()
    }
}

#[cfg(test)]
mod test {
    use std::io::Write;

    use super::*;

    #[test]
    fn kangaroo_catalog_resolves_known_ids() {
        let catalog = ClassCatalog::kangaroo();

        assert_eq!(catalog.len(), 2);
        assert_eq!(catalog.get(1).map(|l| l.name.as_str()), Some("Kangaroo"));
        assert_eq!(catalog.get(2).map(|l| l.name.as_str()), Some("Other"));
        assert!(catalog.get(3).is_none());
        assert!(catalog.get(0).is_none());
    }

    #[test]
    fn parse_labels_file() -> Result<(), Box<dyn std::error::Error>> {
        let mut file = tempfile::NamedTempFile::new()?;
        writeln!(file, "# id,name")?;
        writeln!(file, "1, Kangaroo")?;
        writeln!(file)?;
        writeln!(file, "7,Wallaby")?;

        let catalog = ClassCatalog::from_labels_file(file.path())?;

        assert_eq!(catalog.len(), 2);
        assert_eq!(catalog.get(1).map(|l| l.name.as_str()), Some("Kangaroo"));
        assert_eq!(catalog.get(7).map(|l| l.name.as_str()), Some("Wallaby"));

        Ok(())
    }

    #[test]
    fn reject_malformed_line() -> Result<(), Box<dyn std::error::Error>> {
        let mut file = tempfile::NamedTempFile::new()?;
        writeln!(file, "1,Kangaroo")?;
        writeln!(file, "two,Other")?;

        match ClassCatalog::from_labels_file(file.path()) {
            Err(CatalogError::Malformed { line, .. }) => assert_eq!(line, 2),
            other => panic!("expected malformed line error, got {other:?}"),
        }

        Ok(())
    }

    #[test]
    fn reject_duplicate_id() -> Result<(), Box<dyn std::error::Error>> {
        let mut file = tempfile::NamedTempFile::new()?;
        writeln!(file, "1,Kangaroo")?;
        writeln!(file, "1,Other")?;

        assert!(matches!(
            ClassCatalog::from_labels_file(file.path()),
            Err(CatalogError::Duplicate { line: 2, id: 1 })
        ));

        Ok(())
    }
}
