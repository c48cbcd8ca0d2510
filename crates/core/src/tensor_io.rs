//! Flat tensor persistence.
//!
//! A tensor saved under `base` becomes two files:
//! - `<base>.npy`: the elements as a 1-D NumPy array, row-major
//! - `<base>.json`: the shape as a JSON array of integers

use std::collections::HashMap;
use std::ffi::OsString;
use std::fs::{self, File};
use std::io::{BufReader, BufWriter, ErrorKind};
use std::path::{Path, PathBuf};

use candle_core::{Device, Tensor};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum TensorIoError {
    #[error("I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("invalid shape descriptor {path}: {source}")]
    Shape {
        path: PathBuf,
        source: serde_json::Error,
    },

    #[error("{path}: shape {shape:?} needs {expected} elements, data has {actual}")]
    ElementCount {
        path: PathBuf,
        shape: Vec<usize>,
        expected: usize,
        actual: usize,
    },

    #[error("tensor error: {0}")]
    Tensor(#[from] candle_core::Error),
}

pub type Result<T> = std::result::Result<T, TensorIoError>;

fn with_suffix(base: &Path, suffix: &str) -> PathBuf {
    let mut name = OsString::from(base.as_os_str());
    name.push(suffix);
    PathBuf::from(name)
}

/// Path of the data file of `base`.
pub fn data_path(base: &Path) -> PathBuf {
    with_suffix(base, ".npy")
}

/// Path of the shape descriptor of `base`.
pub fn shape_path(base: &Path) -> PathBuf {
    with_suffix(base, ".json")
}

fn io_err(path: &Path) -> impl FnOnce(std::io::Error) -> TensorIoError + '_ {
    move |source| TensorIoError::Io {
        path: path.to_path_buf(),
        source,
    }
}

/// Save `tensor` under `base`, overwriting existing files.
pub fn save(base: impl AsRef<Path>, tensor: &Tensor) -> Result<()> {
    let base = base.as_ref();
    let data = data_path(base);
    let shape = shape_path(base);

    if let Some(parent) = base.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent).map_err(io_err(parent))?;
    }

    tensor.flatten_all()?.write_npy(&data)?;

    let file = File::create(&shape).map_err(io_err(&shape))?;
    serde_json::to_writer(BufWriter::new(file), tensor.dims()).map_err(|source| {
        TensorIoError::Shape {
            path: shape.clone(),
            source,
        }
    })?;

    tracing::trace!(path = %data.display(), shape = ?tensor.dims(), "saved tensor");
    Ok(())
}

/// Load the tensor saved under `base` onto `device`, with its saved dtype.
pub fn load(base: impl AsRef<Path>, device: &Device) -> Result<Tensor> {
    let base = base.as_ref();
    let data = data_path(base);
    let shape_file = shape_path(base);

    let file = File::open(&shape_file).map_err(io_err(&shape_file))?;
    let shape: Vec<usize> =
        serde_json::from_reader(BufReader::new(file)).map_err(|source| TensorIoError::Shape {
            path: shape_file.clone(),
            source,
        })?;

    if !data.exists() {
        return Err(TensorIoError::Io {
            path: data,
            source: std::io::Error::new(ErrorKind::NotFound, "data file missing"),
        });
    }
    let flat = Tensor::read_npy(&data)?;

    let expected: usize = shape.iter().product();
    if flat.elem_count() != expected {
        return Err(TensorIoError::ElementCount {
            path: data,
            shape,
            expected,
            actual: flat.elem_count(),
        });
    }

    Ok(flat.reshape(shape)?.to_device(device)?)
}

/// Delete both files of `base`. A file that is already gone is logged, not
/// reported as an error.
pub fn remove(base: impl AsRef<Path>) -> Result<()> {
    let base = base.as_ref();
    for path in [data_path(base), shape_path(base)] {
        match fs::remove_file(&path) {
            Ok(()) => {}
            Err(e) if e.kind() == ErrorKind::NotFound => {
                tracing::warn!(path = %path.display(), "tensor file not found, nothing to remove");
            }
            Err(source) => return Err(TensorIoError::Io { path, source }),
        }
    }
    Ok(())
}

/// Load several tensors into a map keyed by variable name, suitable for
/// `VarBuilder::from_tensors`.
///
/// `names` pairs each variable name with its file base relative to `dir`.
pub fn load_var_map<'a, I>(
    dir: impl AsRef<Path>,
    names: I,
    device: &Device,
) -> Result<HashMap<String, Tensor>>
where
    I: IntoIterator<Item = (&'a str, &'a str)>,
{
    let dir = dir.as_ref();
    names
        .into_iter()
        .map(|(var, file)| Ok((var.to_string(), load(dir.join(file), device)?)))
        .collect()
}
