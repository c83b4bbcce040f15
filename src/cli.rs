//! clapでコマンドラインの構造を定義します。
//!
//! 階数 `--n-stories` はすべてのサブコマンドで必須です。構造次元が暗黙の
//! 既定値から決まることを避けるため、省略はエラーになります。

use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;

/// コマンドライン全体の定義。
#[derive(Parser, Debug)]
#[command(author, version, about = "地震動から層間変形角を予測する物理情報サロゲート (Burn)", long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

/// 共通の構造設定（N・質量・剛性・Rayleigh 係数・階高）。
#[derive(Args, Debug, Clone)]
pub struct StructureArgs {
    /// 階数 N（必須。既定値は存在しない）
    #[arg(long)]
    pub n_stories: usize,
    /// 階あたり質量 [t]
    #[arg(long, default_value_t = 1.0)]
    pub story_mass: f64,
    /// 層剛性 [kN/m]
    #[arg(long, default_value_t = 100.0)]
    pub story_stiffness: f64,
    /// Rayleigh 減衰係数 α
    #[arg(long, default_value_t = 0.05)]
    pub rayleigh_alpha: f64,
    /// Rayleigh 減衰係数 β
    #[arg(long, default_value_t = 0.002)]
    pub rayleigh_beta: f64,
    /// 階高 [m]
    #[arg(long, default_value_t = 3.0)]
    pub story_height: f64,
}

/// 実行するサブコマンドを定義します。
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// 合成地震動と線形応答のキャンペーンを生成し、CSV として保存します
    Generate {
        /// 構造設定
        #[command(flatten)]
        structure: StructureArgs,
        /// 出力ディレクトリ
        #[arg(long, default_value = "data/raw")]
        out_dir: PathBuf,
        /// 生成する記録の本数
        #[arg(long, default_value_t = 20)]
        n_records: usize,
        /// 1記録の時間サンプル数
        #[arg(long, default_value_t = 1000)]
        n_steps: usize,
        /// 時間刻み Δt [s]
        #[arg(long, default_value_t = 0.02)]
        dt: f64,
        /// 乱数シード
        #[arg(long, default_value_t = 42)]
        seed: u64,
    },
    /// サロゲートモデルを学習し、最良チェックポイントを保存します
    Train {
        /// 構造設定
        #[command(flatten)]
        structure: StructureArgs,
        /// 生記録の入力ディレクトリ
        #[arg(long, default_value = "data/raw")]
        data_dir: PathBuf,
        /// チェックポイント等の出力ディレクトリ
        #[arg(long, default_value = "artifacts")]
        artifacts_dir: PathBuf,
        /// 物理損失の重み λ
        #[arg(long, default_value_t = 0.1)]
        lambda: f64,
        /// 最大エポック数
        #[arg(long, default_value_t = 500)]
        max_epochs: usize,
        /// 早期終了の patience
        #[arg(long, default_value_t = 50)]
        patience: usize,
        /// 乱数シード（レコード分割に使用）
        #[arg(long, default_value_t = 42)]
        seed: u64,
        /// 入力ウィンドウ長
        #[arg(long, default_value_t = 64)]
        window_len: usize,
    },
    /// 保存済みチェックポイントをテストパーティションで評価します
    Evaluate {
        /// 構造設定
        #[command(flatten)]
        structure: StructureArgs,
        /// 生記録の入力ディレクトリ
        #[arg(long, default_value = "data/raw")]
        data_dir: PathBuf,
        /// チェックポイントのディレクトリ
        #[arg(long, default_value = "artifacts")]
        artifacts_dir: PathBuf,
        /// 乱数シード（学習時と同じ値で分割を再現する）
        #[arg(long, default_value_t = 42)]
        seed: u64,
        /// 入力ウィンドウ長（学習時と同じ値）
        #[arg(long, default_value_t = 64)]
        window_len: usize,
        /// レイテンシ測定の反復回数
        #[arg(long, default_value_t = 200)]
        latency_iters: usize,
    },
}
