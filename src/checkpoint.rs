//! モデルチェックポイントの保存と読み込み。
//!
//! 重みは NamedMpk 形式、メタデータ（階数 N・エポック・
//! 検証損失・作成時刻）は隣接する JSON に保存します。読み込み側は必ず
//! メタデータの N を現在の `GeometryDescriptor` と照合し、食い違いは
//! `DimensionMismatchError` で拒否します。

use crate::error::{PinnError, Result};
use crate::geometry::GeometryDescriptor;
use crate::model::DriftSurrogate;
use crate::{CHECKPOINT_META_FILENAME, MODEL_FILENAME};
use burn::module::Module;
use burn::prelude::Backend;
use burn::record::{FullPrecisionSettings, NamedMpkFileRecorder};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

/// チェックポイントのメタデータ
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckpointMeta {
    /// モデルの階数 N
    pub n_stories: usize,
    /// 入力ウィンドウ長
    pub window_len: usize,
    /// 隠れ層の幅
    pub hidden_size: usize,
    /// 保存時のエポック
    pub epoch: usize,
    /// 保存時の検証損失
    pub validation_loss: f32,
    /// 作成時刻 (RFC 3339)
    pub created_at: String,
}

impl CheckpointMeta {
    /// 現在時刻つきでメタデータを作ります。
    pub fn new(
        n_stories: usize,
        window_len: usize,
        hidden_size: usize,
        epoch: usize,
        validation_loss: f32,
    ) -> Self {
        Self {
            n_stories,
            window_len,
            hidden_size,
            epoch,
            validation_loss,
            created_at: Utc::now().to_rfc3339(),
        }
    }
}

/// モデルとメタデータを `dir` に保存します。既存のチェックポイントは
/// 上書きされます（改善のたびに呼ばれる前提）。
pub fn save_checkpoint<B: Backend>(
    model: DriftSurrogate<B>,
    meta: &CheckpointMeta,
    dir: &Path,
) -> Result<()> {
    fs::create_dir_all(dir)?;
    model
        .save_file(
            dir.join(MODEL_FILENAME),
            &NamedMpkFileRecorder::<FullPrecisionSettings>::new(),
        )
        .map_err(|e| PinnError::Checkpoint(e.to_string()))?;
    fs::write(
        dir.join(CHECKPOINT_META_FILENAME),
        serde_json::to_string_pretty(meta)?,
    )?;
    Ok(())
}

/// チェックポイントを読み込みます。
///
/// メタデータの N が `geometry` の N と一致しない場合は重みを読む前に
/// `DimensionMismatchError` を返します。
pub fn load_checkpoint<B: Backend>(
    dir: &Path,
    geometry: &GeometryDescriptor,
    device: &B::Device,
) -> Result<(DriftSurrogate<B>, CheckpointMeta)> {
    let meta: CheckpointMeta =
        serde_json::from_str(&fs::read_to_string(dir.join(CHECKPOINT_META_FILENAME))?)?;
    if meta.n_stories != geometry.n_stories() {
        return Err(PinnError::DimensionMismatch {
            expected: geometry.n_stories(),
            found: meta.n_stories,
        });
    }
    let model = DriftSurrogate::<B>::new(geometry, meta.window_len, meta.hidden_size, device)
        .load_file(
            dir.join(MODEL_FILENAME),
            &NamedMpkFileRecorder::<FullPrecisionSettings>::new(),
            device,
        )
        .map_err(|e| PinnError::Checkpoint(e.to_string()))?;
    Ok((model, meta))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::geometry::StoryParam;
    use burn::backend::NdArray;

    type B = NdArray<f32>;

    fn geom(n: usize) -> GeometryDescriptor {
        GeometryDescriptor::new(
            n,
            StoryParam::Uniform(1.0),
            StoryParam::Uniform(1.0),
            0.02,
            0.01,
            3.0,
        )
        .unwrap()
    }

    #[test]
    fn roundtrip_preserves_meta() {
        let device = Default::default();
        let dir = tempfile::tempdir().unwrap();
        let g = geom(3);
        let model = DriftSurrogate::<B>::new(&g, 16, 8, &device);
        let meta = CheckpointMeta::new(3, 16, 8, 12, 0.125);
        save_checkpoint(model, &meta, dir.path()).unwrap();

        let (loaded, loaded_meta) = load_checkpoint::<B>(dir.path(), &g, &device).unwrap();
        assert_eq!(loaded.n_stories(), 3);
        assert_eq!(loaded_meta.epoch, 12);
        assert!((loaded_meta.validation_loss - 0.125).abs() < 1e-9);
    }

    #[test]
    fn rejects_checkpoint_with_mismatched_n() {
        let device = Default::default();
        let dir = tempfile::tempdir().unwrap();
        let model = DriftSurrogate::<B>::new(&geom(5), 16, 8, &device);
        save_checkpoint(model, &CheckpointMeta::new(5, 16, 8, 1, 1.0), dir.path()).unwrap();

        let err = load_checkpoint::<B>(dir.path(), &geom(3), &device).unwrap_err();
        match err {
            PinnError::DimensionMismatch { expected, found } => {
                assert_eq!(expected, 3);
                assert_eq!(found, 5);
            }
            other => panic!("想定外のエラー種別: {other:?}"),
        }
    }
}
