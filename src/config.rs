//! 実験設定。
//!
//! 階数 N・物理損失の重み λ・分割比・乱数シードなど、構造次元や再現性に
//! 関わる値はすべてこの不変の設定オブジェクトで明示的に受け渡します。
//! 暗黙のグローバル既定値から階数が決まることは許しません。

use crate::error::{PinnError, Result};
use serde::{Deserialize, Serialize};

/// 1回の実験（データ生成〜学習〜評価）を定める設定値。
///
/// 構築後は読み取り専用として扱い、各コンポーネントへ参照で渡します。
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExperimentConfig {
    /// 階数 N（すべてのテンソル形状の源）
    pub n_stories: usize,
    /// 物理損失の重み λ
    pub lambda_physics: f64,
    /// Adam の学習率
    pub learning_rate: f64,
    /// 最大エポック数
    pub max_epochs: usize,
    /// 早期終了の patience（検証損失が改善しないまま許容するエポック数）
    pub patience: usize,
    /// 学習データの割合
    pub train_ratio: f64,
    /// 検証データの割合
    pub val_ratio: f64,
    /// テストデータの割合
    pub test_ratio: f64,
    /// 乱数シード（分割・合成記録の生成に共通で使用）
    pub seed: u64,
    /// 入力波形ウィンドウ長（サンプル数）
    pub window_len: usize,
    /// ウィンドウのスライド幅
    pub window_stride: usize,
    /// ミニバッチサイズ
    pub batch_size: usize,
    /// MLP の隠れ層の幅
    pub hidden_size: usize,
    /// 階高 [m]（層間変形角の分母）
    pub story_height: f64,
}

impl ExperimentConfig {
    /// 階数 N を明示して基準設定を作ります。
    ///
    /// 構造次元が暗黙の既定値から決まることを防ぐため、`Default` は
    /// 提供しません。N 以外は標準的な学習設定で初期化されます。
    pub fn for_stories(n_stories: usize) -> Self {
        Self {
            n_stories,
            lambda_physics: 0.1,
            learning_rate: 1e-3,
            max_epochs: 500,
            patience: 50,
            train_ratio: 0.70,
            val_ratio: 0.15,
            test_ratio: 0.15,
            seed: 42,
            window_len: 64,
            window_stride: 32,
            batch_size: 16,
            hidden_size: 32,
            story_height: 3.0,
        }
    }

    /// 設定値を検証します。不正な値は `ConfigurationError` で即座に報告します。
    pub fn validate(&self) -> Result<()> {
        if self.n_stories == 0 {
            return Err(PinnError::Configuration(
                "n_stories は 1 以上が必要です".into(),
            ));
        }
        let total = self.train_ratio + self.val_ratio + self.test_ratio;
        if (total - 1.0).abs() > 1e-6 {
            return Err(PinnError::Configuration(format!(
                "分割比の合計は 1.0 が必要です (実際 {total})"
            )));
        }
        if self.train_ratio <= 0.0 || self.val_ratio < 0.0 || self.test_ratio < 0.0 {
            return Err(PinnError::Configuration(
                "分割比が負、または学習分割が空です".into(),
            ));
        }
        if self.lambda_physics < 0.0 {
            return Err(PinnError::Configuration(format!(
                "lambda_physics は非負が必要です (実際 {})",
                self.lambda_physics
            )));
        }
        if self.window_len < 8 {
            return Err(PinnError::Configuration(format!(
                "window_len は 8 以上が必要です (実際 {})",
                self.window_len
            )));
        }
        if self.window_stride == 0 || self.batch_size == 0 || self.max_epochs == 0 {
            return Err(PinnError::Configuration(
                "window_stride / batch_size / max_epochs は 1 以上が必要です".into(),
            ));
        }
        if self.story_height <= 0.0 {
            return Err(PinnError::Configuration(format!(
                "story_height は正の値が必要です (実際 {})",
                self.story_height
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn baseline_config_requires_explicit_story_count() {
        let cfg = ExperimentConfig::for_stories(3);
        assert_eq!(cfg.n_stories, 3);
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn rejects_zero_stories() {
        let cfg = ExperimentConfig::for_stories(0);
        assert!(matches!(
            cfg.validate(),
            Err(PinnError::Configuration(_))
        ));
    }

    #[test]
    fn rejects_ratios_not_summing_to_one() {
        let cfg = ExperimentConfig {
            train_ratio: 0.5,
            val_ratio: 0.2,
            test_ratio: 0.2,
            ..ExperimentConfig::for_stories(5)
        };
        assert!(matches!(cfg.validate(), Err(PinnError::Configuration(_))));
    }

    #[test]
    fn rejects_negative_lambda() {
        let cfg = ExperimentConfig {
            lambda_physics: -1.0,
            ..ExperimentConfig::for_stories(5)
        };
        assert!(cfg.validate().is_err());
    }
}
