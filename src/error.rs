//! パイプライン全体で共有するエラー型。
//!
//! 致命的なエラーには必ず「どの記録か」「どの次元が食い違ったか」を含めます。
//! 1レコードの取り込み失敗はデータセット全体を止めず、集約して報告します
//! （集約の実装は `ingest` モジュール側）。

use thiserror::Error;

/// このクレート共通の `Result` エイリアス
pub type Result<T> = std::result::Result<T, PinnError>;

/// drift-pinn パイプラインのエラー種別
#[derive(Error, Debug)]
pub enum PinnError {
    /// 実験設定が不正（N ≤ 0、パラメータ列長の不一致など）
    #[error("設定が不正です: {0}")]
    Configuration(String),

    /// 生記録ファイルの取り込みに失敗
    #[error("記録 '{record_id}' の取り込みに失敗しました: {reason}")]
    Ingest {
        /// 対象レコードの識別子（ファイル名 stem）
        record_id: String,
        /// 失敗理由
        reason: String,
    },

    /// チェックポイントに記録された階数と現在の構造設定が食い違った
    #[error("階数が一致しません: 設定 N={expected}, 実際 N={found}")]
    DimensionMismatch {
        /// 現在の GeometryDescriptor の階数
        expected: usize,
        /// 相手側（チェックポイント・記録ファイル等）の階数
        found: usize,
    },

    /// バッチ内のテンソル形状が不整合
    #[error("テンソル形状が不正です: {0}")]
    Shape(String),

    /// データ分割が成立しない（必要なパーティションが空になる等）
    #[error("データセット構築に失敗しました: {0}")]
    Data(String),

    /// 学習中に損失が発散（NaN / Inf）
    #[error("epoch {epoch} で損失が発散しました (loss = {loss})。直前のチェックポイントは保持されています")]
    Divergence {
        /// 発散を検出したエポック
        epoch: usize,
        /// 発散時の損失値
        loss: f32,
    },

    /// チェックポイントの保存・読み込みに失敗
    #[error("チェックポイント入出力に失敗しました: {0}")]
    Checkpoint(String),

    /// 入出力エラー
    #[error("入出力エラー: {0}")]
    Io(#[from] std::io::Error),

    /// JSON のシリアライズ／デシリアライズエラー
    #[error("JSONエラー: {0}")]
    Json(#[from] serde_json::Error),
}
