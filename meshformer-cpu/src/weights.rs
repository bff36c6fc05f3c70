//! SafeTensors checkpoint store for the CPU backend.
//!
//! One `shard_{rank}.safetensors` file per shard in a directory. Files are
//! memory-mapped on read and every stored dtype is decoded to f32.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use memmap2::Mmap;
use safetensors::tensor::TensorView;
use safetensors::{Dtype, SafeTensors};
use tracing::{debug, info};

use meshformer::checkpoint::{reshard, CheckpointShapeMap, CheckpointStore};
use meshformer::dtype::DType;
use meshformer::params::{HostTensor, ParamSet};
use meshformer::{Error, Result};

/// Directory of per-shard safetensors files.
#[derive(Debug, Clone)]
pub struct SafeTensorsCheckpoint {
    dir: PathBuf,
}

impl SafeTensorsCheckpoint {
    pub fn new(dir: impl AsRef<Path>) -> Self {
        Self {
            dir: dir.as_ref().to_path_buf(),
        }
    }

    #[must_use]
    pub fn shard_path(&self, rank: usize) -> PathBuf {
        self.dir.join(format!("shard_{rank}.safetensors"))
    }

    /// Number of consecutive `shard_{rank}` files present, starting at 0.
    #[must_use]
    pub fn stored_shard_count(&self) -> usize {
        (0..).take_while(|&rank| self.shard_path(rank).is_file()).count()
    }

    fn read_shard(&self, rank: usize) -> Result<ParamSet> {
        let path = self.shard_path(rank);
        let file = std::fs::File::open(&path)?;
        // SAFETY: the file is only read, and checkpoints are not modified
        // while a load is in progress.
        let mmap = unsafe { Mmap::map(&file)? };
        let st = SafeTensors::deserialize(&mmap).map_err(|e| {
            Error::SafeTensors(format!("Failed to parse {}: {e}", path.display()))
        })?;

        let mut params = ParamSet::new();
        for (name, view) in st.tensors() {
            let dtype_str = format!("{:?}", view.dtype());
            let dtype = DType::from_safetensors(&dtype_str)
                .ok_or_else(|| Error::UnsupportedDtype(format!("{dtype_str} for {name}")))?;
            let data = dtype.decode_f32(view.data())?;
            params.insert(name, HostTensor::new(view.shape(), data)?);
        }
        Ok(params)
    }
}

const fn safetensors_dtype(dtype: DType) -> Dtype {
    match dtype {
        DType::F32 => Dtype::F32,
        DType::F16 => Dtype::F16,
        DType::BF16 => Dtype::BF16,
    }
}

impl CheckpointStore for SafeTensorsCheckpoint {
    fn write(&mut self, shards: &[ParamSet], shape_map: &CheckpointShapeMap) -> Result<()> {
        let shard_count = shape_map.topology().shard_count;
        if shards.len() != shard_count {
            return Err(Error::InvalidInput(format!(
                "{} shards for shard_count {shard_count}",
                shards.len()
            )));
        }
        for shard in shards {
            shape_map.validate_shard(shard)?;
        }
        std::fs::create_dir_all(&self.dir)?;

        for (rank, shard) in shards.iter().enumerate() {
            let encoded = shard
                .iter()
                .map(|(path, tensor)| {
                    let dtype = shape_map.get(path).map_or(DType::F32, |spec| spec.dtype);
                    (path.clone(), dtype, dtype.encode_f32(tensor.data()))
                })
                .collect::<Vec<_>>();
            let views = encoded
                .iter()
                .map(|(path, dtype, bytes)| {
                    let shape = shard[path].shape().to_vec();
                    TensorView::new(safetensors_dtype(*dtype), shape, bytes)
                        .map(|view| (path.clone(), view))
                        .map_err(|e| Error::SafeTensors(format!("{path}: {e}")))
                })
                .collect::<Result<Vec<_>>>()?;
            let metadata = Some(HashMap::from([
                ("shard_rank".to_string(), rank.to_string()),
                ("shard_count".to_string(), shard_count.to_string()),
            ]));
            let path = self.shard_path(rank);
            safetensors::serialize_to_file(views, &metadata, &path).map_err(|e| {
                Error::SafeTensors(format!("Failed to write {}: {e}", path.display()))
            })?;
            debug!(rank, path = %path.display(), "Wrote checkpoint shard");
        }

        // Drop stale shards from an earlier, wider checkpoint.
        let mut stale = shard_count;
        while self.shard_path(stale).is_file() {
            std::fs::remove_file(self.shard_path(stale))?;
            stale += 1;
        }
        info!(dir = %self.dir.display(), shard_count, "Saved checkpoint");
        Ok(())
    }

    fn read(&self, shape_map: &CheckpointShapeMap) -> Result<Vec<ParamSet>> {
        let stored = self.stored_shard_count();
        if stored == 0 {
            return Err(Error::InvalidInput(format!(
                "no checkpoint shards in {}",
                self.dir.display()
            )));
        }
        let shards = (0..stored)
            .map(|rank| self.read_shard(rank))
            .collect::<Result<Vec<_>>>()?;

        let target = shape_map.topology().shard_count;
        info!(
            dir = %self.dir.display(),
            stored_shards = stored,
            shard_count = target,
            "Loading checkpoint"
        );
        if stored == target {
            for shard in &shards {
                shape_map.validate_shard(shard)?;
            }
            Ok(shards)
        } else {
            reshard(&shards, shape_map)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use meshformer::config::{Architecture, ModelConfig};
    use meshformer::shard::ShardTopology;

    fn map(shards: usize) -> CheckpointShapeMap {
        let mut config = ModelConfig::new(Architecture::GptJ, 16, 8, 2, 1, 4);
        config.topology = ShardTopology::new(shards, 1);
        CheckpointShapeMap::new(&config).unwrap()
    }

    #[allow(clippy::cast_precision_loss)]
    fn logical(map: &CheckpointShapeMap) -> ParamSet {
        map.iter()
            .map(|(path, spec)| {
                let n: usize = spec.logical_shape.iter().product();
                let data = (0..n).map(|i| i as f32 * 0.25).collect();
                (path.clone(), HostTensor::new(&spec.logical_shape, data).unwrap())
            })
            .collect()
    }

    #[test]
    fn test_write_read_same_topology() {
        let dir = tempfile::tempdir().unwrap();
        let map = map(2);
        let shards = map.shard(&logical(&map)).unwrap();
        let mut store = SafeTensorsCheckpoint::new(dir.path());
        store.write(&shards, &map).unwrap();
        assert_eq!(store.stored_shard_count(), 2);
        assert_eq!(store.read(&map).unwrap(), shards);
    }

    #[test]
    fn test_read_reshards() {
        let dir = tempfile::tempdir().unwrap();
        let two = map(2);
        let one = map(1);
        let params = logical(&one);
        let mut store = SafeTensorsCheckpoint::new(dir.path());
        store.write(&two.shard(&params).unwrap(), &two).unwrap();
        assert_eq!(store.read(&one).unwrap()[0], params);

        // rewriting with fewer shards removes the stale file
        store.write(&one.shard(&params).unwrap(), &one).unwrap();
        assert_eq!(store.stored_shard_count(), 1);
    }

    #[test]
    fn test_bf16_storage_is_lossy_but_close() {
        let dir = tempfile::tempdir().unwrap();
        let map = map(1).with_dtype(DType::BF16);
        let params = logical(&map);
        let mut store = SafeTensorsCheckpoint::new(dir.path());
        store.write(&map.shard(&params).unwrap(), &map).unwrap();
        let back = store.read(&map).unwrap().remove(0);
        for (path, tensor) in &params {
            for (a, b) in tensor.data().iter().zip(back[path].data()) {
                assert!((a - b).abs() <= a.abs() / 100.0, "{path}: {a} vs {b}");
            }
        }
    }

    #[test]
    fn test_shape_mismatch_aborts_load() {
        let dir = tempfile::tempdir().unwrap();
        let small = map(1);
        let mut store = SafeTensorsCheckpoint::new(dir.path());
        store
            .write(&small.shard(&logical(&small)).unwrap(), &small)
            .unwrap();

        let mut wide = ModelConfig::new(Architecture::GptJ, 16, 16, 2, 1, 4);
        wide.topology = ShardTopology::single();
        let wide = CheckpointShapeMap::new(&wide).unwrap();
        assert!(matches!(
            store.read(&wide),
            Err(Error::ShapeMismatch { .. })
        ));
    }

    #[test]
    fn test_empty_dir() {
        let dir = tempfile::tempdir().unwrap();
        assert!(SafeTensorsCheckpoint::new(dir.path()).read(&map(1)).is_err());
    }
}
