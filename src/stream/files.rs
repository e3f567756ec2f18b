//! The files exchanged between the encryption and the decryption stage.
//!
//! Index files start with a header line, followed by `name,index` lines. Data files hold one
//! row per line, as raw bytes. Global parameters are a JSON object of integer values. Encryption
//! results and expanded keys are stored with `bincode`.

use std::{
    collections::BTreeMap,
    fs::File,
    io::{BufRead, BufReader, BufWriter, Write},
    path::{Path, PathBuf},
};

use serde::{Deserialize, Serialize, de::DeserializeOwned};

use super::{EncryptionResults, Error};
use crate::aes_ctr::ExpandedKey;

/// The number of rows of the partner (advertiser).
pub const ADV_ROW_COUNT: &str = "adv_row_count";
/// The number of rows of the publisher.
pub const PUB_ROW_COUNT: &str = "pub_row_count";
/// The row width of the partner (advertiser) in bytes.
pub const ADV_DATA_WIDTH: &str = "adv_data_width";
/// The row width of the publisher in bytes.
pub const PUB_DATA_WIDTH: &str = "pub_data_width";

fn io_error(path: &Path) -> impl FnOnce(std::io::Error) -> Error + '_ {
    move |source| Error::Io {
        path: path.to_path_buf(),
        source,
    }
}

fn open(path: &Path) -> Result<BufReader<File>, Error> {
    Ok(BufReader::new(File::open(path).map_err(io_error(path))?))
}

fn create(path: &Path) -> Result<BufWriter<File>, Error> {
    Ok(BufWriter::new(File::create(path).map_err(io_error(path))?))
}

/// The paths `{base}_0` to `{base}_{n-1}`.
pub fn sharded_paths(base: impl AsRef<Path>, n: usize) -> Vec<PathBuf> {
    let base = base.as_ref().as_os_str();
    (0..n)
        .map(|i| {
            let mut path = base.to_os_string();
            path.push(format!("_{i}"));
            PathBuf::from(path)
        })
        .collect()
}

/// Reads the second column of every line after the header.
pub fn read_index_file(path: &Path) -> Result<Vec<u64>, Error> {
    let mut indexes = vec![];
    for (i, line) in open(path)?.lines().enumerate().skip(1) {
        let line = line.map_err(io_error(path))?;
        if line.trim().is_empty() {
            continue;
        }
        let index = line
            .split(',')
            .nth(1)
            .and_then(|index| index.trim().parse().ok())
            .ok_or_else(|| Error::MalformedLine {
                path: path.to_path_buf(),
                line: i + 1,
            })?;
        indexes.push(index);
    }
    Ok(indexes)
}

/// Writes an index file, naming each row by its position.
pub fn write_index_file(path: &Path, indexes: &[u64]) -> Result<(), Error> {
    let mut file = create(path)?;
    writeln!(file, "id,index").map_err(io_error(path))?;
    for (i, index) in indexes.iter().enumerate() {
        writeln!(file, "{i},{index}").map_err(io_error(path))?;
    }
    file.flush().map_err(io_error(path))
}

/// Iterates over the rows of a data file without loading all of them.
pub fn data_file_lines(
    path: &Path,
) -> Result<impl Iterator<Item = Result<Vec<u8>, Error>> + use<>, Error> {
    let owned = path.to_path_buf();
    Ok(open(path)?.split(b'\n').map(move |line| {
        line.map_err(|source| Error::Io {
            path: owned.clone(),
            source,
        })
    }))
}

/// Reads all rows of a data file.
pub fn read_data_file(path: &Path) -> Result<Vec<Vec<u8>>, Error> {
    data_file_lines(path)?.collect()
}

/// Writes rows to a data file. Rows must not contain newlines.
pub fn write_data_file(path: &Path, rows: &[Vec<u8>]) -> Result<(), Error> {
    let mut file = create(path)?;
    for row in rows {
        file.write_all(row).map_err(io_error(path))?;
        file.write_all(b"\n").map_err(io_error(path))?;
    }
    file.flush().map_err(io_error(path))
}

/// Integer parameters known to both parties before the run.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct GlobalParameters(BTreeMap<String, i64>);

impl GlobalParameters {
    /// Reads the parameters from a JSON file.
    pub fn read(path: &Path) -> Result<Self, Error> {
        serde_json::from_reader(open(path)?).map_err(|source| Error::Json {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Writes the parameters to a JSON file.
    pub fn write(&self, path: &Path) -> Result<(), Error> {
        let mut file = create(path)?;
        serde_json::to_writer_pretty(&mut file, self).map_err(|source| Error::Json {
            path: path.to_path_buf(),
            source,
        })?;
        file.flush().map_err(io_error(path))
    }

    /// Sets a parameter.
    pub fn set(&mut self, name: &str, value: i64) {
        self.0.insert(name.to_string(), value);
    }

    /// A parameter that must be present and a valid size.
    pub fn size(&self, name: &str) -> Result<usize, Error> {
        self.0
            .get(name)
            .and_then(|&value| usize::try_from(value).ok())
            .ok_or_else(|| Error::MissingParameter(name.to_string()))
    }
}

fn write_bincode(path: &Path, value: &impl Serialize) -> Result<(), Error> {
    let mut file = create(path)?;
    bincode::serialize_into(&mut file, value).map_err(|source| Error::Bincode {
        path: path.to_path_buf(),
        source,
    })?;
    file.flush().map_err(io_error(path))
}

fn read_bincode<T: DeserializeOwned>(path: &Path) -> Result<T, Error> {
    bincode::deserialize_from(open(path)?).map_err(|source| Error::Bincode {
        path: path.to_path_buf(),
        source,
    })
}

/// Writes one shard of encryption results.
pub fn write_encryption_results(path: &Path, results: &EncryptionResults) -> Result<(), Error> {
    write_bincode(path, results)
}

/// Reads one shard of encryption results.
pub fn read_encryption_results(path: &Path) -> Result<EncryptionResults, Error> {
    read_bincode(path)
}

/// Writes the key that all of this party's rows were encrypted with.
pub fn write_expanded_key(path: &Path, key: &ExpandedKey) -> Result<(), Error> {
    write_bincode(path, key)
}

/// Reads the key that all of this party's rows were encrypted with.
pub fn read_expanded_key(path: &Path) -> Result<ExpandedKey, Error> {
    read_bincode(path)
}
