//! # 物理情報ドリフトサロゲート (drift-pinn) ライブラリ
//!
//! `burn` フレームワークを使用して、地動加速度波形から N 層 RC 骨組の
//! 最大層間変形角を予測する物理情報サロゲートモデルを構築・学習する
//! ための主要なコンポーネントを提供します。損失には多自由度系の
//! 運動方程式 M ü + C u̇ + K u + M·1·ü_g = 0 の残差（物理損失）を組み込み、
//! 非線形時刻歴解析の代替として動作します。
//!
//! 階数 N は `GeometryDescriptor` が唯一の情報源であり、すべての行列・
//! テンソル形状はそこから導出されます。

pub mod checkpoint;
pub mod cli;
pub mod config;
pub mod dataset;
pub mod error;
pub mod evaluate;
pub mod geometry;
pub mod ingest;
pub mod model;
pub mod pinn;
pub mod simulate;
pub mod training;

/// モデル重みを保存するファイル名
pub const MODEL_FILENAME: &str = "drift_model.mpk";
/// チェックポイントのメタデータを保存するファイル名
pub const CHECKPOINT_META_FILENAME: &str = "checkpoint.json";
/// 学習に使った設定一式を保存するファイル名
pub const CONFIG_FILENAME: &str = "config.json";
/// 評価レポートを保存するファイル名
pub const METRICS_FILENAME: &str = "metrics.json";
/// 損失履歴グラフを保存するファイル名
pub const LOSS_PLOT_FILENAME: &str = "loss_graph.png";
