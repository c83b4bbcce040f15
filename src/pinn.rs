//! 物理残差の評価。
//!
//! 多自由度系の運動方程式
//!
//! ```text
//! r(t) = M ü(t) + C u̇(t) + K u(t) + M·1·ü_g(t)
//! ```
//!
//! の残差を予測応答に対して計算し、その二乗平均を物理損失として返します。
//! 行列 M, C, K は構築時に渡された `GeometryDescriptor` から作られたもの
//! だけを使い、固定サイズの既定値へのフォールバックは存在しません。
//! 残差テンソルは任意の N に対して各時刻で形状 [N] を持ちます。
//! バッチの形状が合わない場合はブロードキャストせず `ShapeError` で
//! 即座に失敗します。

use crate::error::{PinnError, Result};
use crate::geometry::GeometryDescriptor;
use burn::prelude::Backend;
use burn::tensor::Tensor;

/// f64 の行優先行列を [n, n] のテンソルへ変換します。
fn matrix_tensor<B: Backend>(mat: &[f64], n: usize, device: &B::Device) -> Tensor<B, 2> {
    let values: Vec<f32> = mat.iter().map(|&v| v as f32).collect();
    Tensor::<B, 1>::from_floats(values.as_slice(), device).reshape([n, n])
}

/// 運動方程式の残差と物理損失を計算する評価器。
///
/// M, C, K を記述子から一度だけテンソル化して保持します（記述子は不変
/// なので凍結して問題ありません）。
#[derive(Debug, Clone)]
pub struct PhysicsResidualEvaluator<B: Backend> {
    mass: Tensor<B, 2>,
    damping: Tensor<B, 2>,
    stiffness: Tensor<B, 2>,
    n_stories: usize,
    dt: f32,
}

impl<B: Backend> PhysicsResidualEvaluator<B> {
    /// 記述子の M, C, K から評価器を構築します。`dt` は時間刻みです。
    pub fn new(geometry: &GeometryDescriptor, dt: f32, device: &B::Device) -> Self {
        let n = geometry.n_stories();
        Self {
            mass: matrix_tensor(&geometry.mass_matrix(), n, device),
            damping: matrix_tensor(&geometry.damping_matrix(), n, device),
            stiffness: matrix_tensor(&geometry.stiffness_matrix(), n, device),
            n_stories: n,
            dt,
        }
    }

    /// 評価器の階数 N
    pub fn n_stories(&self) -> usize {
        self.n_stories
    }

    fn check_shapes(
        &self,
        disp: &Tensor<B, 3>,
        vel: &Tensor<B, 3>,
        acc: &Tensor<B, 3>,
        ground: &Tensor<B, 2>,
    ) -> Result<(usize, usize)> {
        let [b, n, t] = disp.dims();
        if n != self.n_stories {
            return Err(PinnError::Shape(format!(
                "変位テンソルの階数 {n} が評価器の N={} と一致しません",
                self.n_stories
            )));
        }
        for (name, dims) in [("速度", vel.dims()), ("加速度", acc.dims())] {
            if dims != [b, n, t] {
                return Err(PinnError::Shape(format!(
                    "{name}テンソルの形状 {dims:?} が変位の [{b}, {n}, {t}] と一致しません"
                )));
            }
        }
        if ground.dims() != [b, t] {
            return Err(PinnError::Shape(format!(
                "地動テンソルの形状 {:?} が [{b}, {t}] と一致しません",
                ground.dims()
            )));
        }
        Ok((b, t))
    }

    /// 残差テンソル r [B, N, T] を計算します。
    pub fn residual(
        &self,
        disp: Tensor<B, 3>,
        vel: Tensor<B, 3>,
        acc: Tensor<B, 3>,
        ground: Tensor<B, 2>,
    ) -> Result<Tensor<B, 3>> {
        let (b, t) = self.check_shapes(&disp, &vel, &acc, &ground)?;
        let n = self.n_stories;
        let expand = |m: &Tensor<B, 2>| m.clone().unsqueeze::<3>().expand([b, n, n]);

        // M·1 は各行の質量和（対角 M なら階質量そのもの）
        let device = ground.device();
        let ones = Tensor::<B, 2>::ones([n, 1], &device);
        let m_ones: Tensor<B, 3> = self.mass.clone().matmul(ones).unsqueeze::<3>();
        let ground_term = m_ones.expand([b, n, t]) * {
            let g: Tensor<B, 3> = ground.unsqueeze_dim(1);
            g.expand([b, n, t])
        };

        let r = expand(&self.mass).matmul(acc)
            + expand(&self.damping).matmul(vel)
            + expand(&self.stiffness).matmul(disp)
            + ground_term;
        Ok(r)
    }

    /// 明示的な (u, u̇, ü) 時刻歴から物理損失 mean(‖r‖²) を計算します。
    pub fn loss_from_series(
        &self,
        disp: Tensor<B, 3>,
        vel: Tensor<B, 3>,
        acc: Tensor<B, 3>,
        ground: Tensor<B, 2>,
    ) -> Result<Tensor<B, 1>> {
        let r = self.residual(disp, vel, acc, ground)?;
        Ok(r.powf_scalar(2.0).mean())
    }

    /// 予測変位場から速度・加速度を中心差分で導出し、物理損失を計算します。
    ///
    /// 微分は内部時刻 (1..T−1) でのみ定義されるため、残差もその範囲で
    /// 評価します。T < 3 は `ShapeError` です。
    pub fn loss_from_displacement(
        &self,
        disp: Tensor<B, 3>,
        ground: Tensor<B, 2>,
    ) -> Result<Tensor<B, 1>> {
        let [b, n, t] = disp.dims();
        if n != self.n_stories {
            return Err(PinnError::Shape(format!(
                "変位テンソルの階数 {n} が評価器の N={} と一致しません",
                self.n_stories
            )));
        }
        if t < 3 {
            return Err(PinnError::Shape(format!(
                "中心差分には 3 点以上の時刻が必要です (T={t})"
            )));
        }
        if ground.dims() != [b, t] {
            return Err(PinnError::Shape(format!(
                "地動テンソルの形状 {:?} が [{b}, {t}] と一致しません",
                ground.dims()
            )));
        }
        let dt = self.dt;
        let u_prev = disp.clone().slice([0..b, 0..n, 0..t - 2]);
        let u_mid = disp.clone().slice([0..b, 0..n, 1..t - 1]);
        let u_next = disp.slice([0..b, 0..n, 2..t]);

        let vel = (u_next.clone() - u_prev.clone()).div_scalar(2.0 * dt);
        let acc = (u_next - u_mid.clone().mul_scalar(2.0) + u_prev).div_scalar(dt * dt);
        let ground_mid = ground.slice([0..b, 1..t - 1]);

        self.loss_from_series(u_mid, vel, acc, ground_mid)
    }
}
