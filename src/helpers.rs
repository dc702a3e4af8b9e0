use std::fmt::{Display, Formatter};
use std::ops::{Add, AddAssign};
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

pub struct TablePrinter {
    rows: Vec<Vec<String>>,
    column_lengths: Vec<usize>
}

impl TablePrinter {
    pub fn new(columns: Vec<String>) -> TablePrinter {
        let column_lengths = columns.iter().map(|x| x.chars().count()).collect::<Vec<_>>();

        TablePrinter {
            rows: vec![columns],
            column_lengths
        }
    }

    pub fn add_row(&mut self, columns: Vec<String>) {
        for (i, column) in columns.iter().enumerate() {
            self.column_lengths[i] = std::cmp::max(self.column_lengths[i], column.chars().count());
        }

        self.rows.push(columns);
    }

    pub fn print(&self) {
        for row in &self.rows {
            for (i, column) in row.iter().enumerate() {
                print!("{}", column);

                if i + 1 < self.column_lengths.len() {
                    for _ in 0..(self.column_lengths[i] - column.chars().count() + 6) {
                        print!(" ");
                    }
                }
            }

            println!();
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct DataSize(pub u64);

impl Display for DataSize {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        let megabytes = self.0 as f64 / 1024.0 / 1024.0;

        if megabytes > 0.1 {
            write!(f, "{:.2} MB", megabytes)
        } else {
            write!(f, "{:.2} KB", megabytes * 1024.0)
        }
    }
}

impl Add for DataSize {
    type Output = DataSize;

    fn add(self, rhs: Self) -> Self::Output {
        DataSize(self.0 + rhs.0)
    }
}

impl AddAssign for DataSize {
    fn add_assign(&mut self, rhs: Self) {
        self.0 += rhs.0;
    }
}

/// Sum of the sizes of every regular file below `path`.
pub fn directory_size(path: &Path) -> std::io::Result<u64> {
    let mut total_size = 0;
    let mut stack = vec![path.to_path_buf()];
    while let Some(current) = stack.pop() {
        for entry in std::fs::read_dir(&current)? {
            let entry = entry?;
            let file_type = entry.file_type()?;
            if file_type.is_dir() {
                stack.push(entry.path());
            } else if file_type.is_file() {
                total_size += entry.metadata()?.len();
            }
        }
    }

    Ok(total_size)
}

pub struct DeferredFileDelete {
    path: PathBuf,
    skip: bool
}

impl DeferredFileDelete {
    pub fn new(path: PathBuf) -> DeferredFileDelete {
        DeferredFileDelete {
            path,
            skip: false,
        }
    }

    pub fn skip(&mut self) {
        self.skip = true;
    }
}

impl Drop for DeferredFileDelete {
    fn drop(&mut self) {
        if !self.skip {
            if let Err(err) = std::fs::remove_file(&self.path) {
                if err.kind() != std::io::ErrorKind::NotFound {
                    log::warn!("Failed to delete file {} due to: {}", self.path.display(), err);
                }
            }
        }
    }
}

pub fn edit_key_value(input: &str) -> Result<(&str, Option<&str>), String> {
    let parts = input.split('=').collect::<Vec<&str>>();

    if parts.len() == 2 {
        let key = parts[0];
        let value = parts[1];
        let value_opt = if value.is_empty() {
            None
        } else {
            Some(value)
        };

        Ok((key, value_opt))
    } else {
        Err("Expected key=value".to_owned())
    }
}

#[test]
fn test_data_size_display() {
    assert_eq!("1.00 KB", DataSize(1024).to_string());
    assert_eq!("2.00 MB", (DataSize(1024 * 1024) + DataSize(1024 * 1024)).to_string());
}

#[test]
fn test_directory_size() {
    let folder = crate::test_helpers::TempFolder::new();
    std::fs::create_dir_all(folder.join("a").join("b")).unwrap();
    std::fs::write(folder.join("a").join("file1"), b"12345").unwrap();
    std::fs::write(folder.join("a").join("b").join("file2"), b"123").unwrap();
    assert_eq!(8, directory_size(&folder).unwrap());
}

#[test]
fn test_edit_key_value() {
    assert_eq!(Ok(("log_level", Some("debug"))), edit_key_value("log_level=debug"));
    assert_eq!(Ok(("log_level", None)), edit_key_value("log_level="));
    assert!(edit_key_value("log_level").is_err());
}
