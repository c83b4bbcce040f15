//! ドリフト予測サロゲートモデル。
//!
//! 地動加速度のウィンドウ [B, W] を入力に、各階の変位時刻歴 [B, N, W] を
//! 予測する多層パーセプトロン（MLP）です。最大層間変形角 [B, N] は変位場
//! から導出します。出力層の次元は構築時に `GeometryDescriptor` の N から
//! 決まります。固定の既定次元は存在しません。

use crate::geometry::GeometryDescriptor;
use burn::module::Module;
use burn::nn::{Linear, LinearConfig, Tanh};
use burn::prelude::Backend;
use burn::tensor::Tensor;

/// 物理情報サロゲートの本体となるニューラルネットワークモデル。
#[derive(Module, Debug)]
pub struct DriftSurrogate<B: Backend> {
    linears: Vec<Linear<B>>,
    activation: Tanh,
    n_stories: usize,
    window_len: usize,
    story_height: f32,
}

impl<B: Backend> DriftSurrogate<B> {
    /// 記述子から出力次元を決めてモデルを初期化します。
    pub fn new(
        geometry: &GeometryDescriptor,
        window_len: usize,
        hidden_size: usize,
        device: &B::Device,
    ) -> Self {
        let n_stories = geometry.n_stories();
        let n_layers = 4;
        let mut linears = Vec::new();
        linears.push(LinearConfig::new(window_len, hidden_size).init(device));
        for _ in 1..(n_layers - 1) {
            linears.push(LinearConfig::new(hidden_size, hidden_size).init(device));
        }
        linears.push(LinearConfig::new(hidden_size, n_stories * window_len).init(device));
        Self {
            linears,
            activation: Tanh::new(),
            n_stories,
            window_len,
            story_height: geometry.story_height() as f32,
        }
    }

    /// 出力の階数 N
    pub fn n_stories(&self) -> usize {
        self.n_stories
    }

    /// 入力ウィンドウ長 W
    pub fn window_len(&self) -> usize {
        self.window_len
    }

    /// 順伝播: 波形 [B, W] → 変位場 [B, N, W]
    pub fn forward(&self, waveform: Tensor<B, 2>) -> Tensor<B, 3> {
        let [batch, _] = waveform.dims();
        let mut x = waveform;
        for i in 0..(self.linears.len() - 1) {
            x = self.linears[i].forward(x);
            x = self.activation.forward(x);
        }
        let out = self.linears.last().unwrap().forward(x);
        out.reshape([batch, self.n_stories, self.window_len])
    }

    /// 変位場 [B, N, W] → 層間変形角の時刻歴 [B, N, W]。
    ///
    /// 第 i 階の層間変形角は (u_i − u_{i−1}) / 階高（u_0 は地面で 0）。
    pub fn drift_history(&self, disp: Tensor<B, 3>) -> Tensor<B, 3> {
        let [b, n, w] = disp.dims();
        let below = if n == 1 {
            Tensor::zeros([b, 1, w], &disp.device())
        } else {
            Tensor::cat(
                vec![
                    Tensor::zeros([b, 1, w], &disp.device()),
                    disp.clone().slice([0..b, 0..n - 1, 0..w]),
                ],
                1,
            )
        };
        (disp - below).div_scalar(self.story_height)
    }

    /// 変位場 [B, N, W] → 最大層間変形角 [B, N]
    pub fn peak_drift(&self, disp: Tensor<B, 3>) -> Tensor<B, 2> {
        self.drift_history(disp).abs().max_dim(2).squeeze(2)
    }

    /// 波形 [B, W] から最大層間変形角 [B, N] を予測します。
    pub fn predict(&self, waveform: Tensor<B, 2>) -> Tensor<B, 2> {
        let disp = self.forward(waveform);
        self.peak_drift(disp)
    }
}
