use anyhow::{ensure, Context, Result};
use std::marker::PhantomData;

use crate::subject::{Image, ImageKind, Subject};

/// A stateless conversion from `I` to `O`, used for subject preprocessing.
///
/// Steps compose with `.then(...)`; the composed pipeline is itself a `Transform`
/// and is what a [`SubjectsDataset`](crate::SubjectsDataset) runs inside the feeder's
/// worker threads.
pub trait Transform<I, O>: Send + Sync {
    fn apply(&self, input: I) -> Result<O>;

    #[inline]
    fn then<T, M>(self, next: T) -> Chain<Self, T, O>
    where
        Self: Sized,
        T: Transform<O, M>,
        O: Send,
        M: Send,
    {
        Chain {
            first: self,
            second: next,
            _marker: PhantomData,
        }
    }
}

/// Two transforms run back to back (`A` -> `B`).
#[derive(Debug)]
pub struct Chain<A, B, M> {
    first: A,
    second: B,
    _marker: PhantomData<fn() -> M>,
}

impl<A, B, M> Chain<A, B, M> {
    pub fn new(first: A, second: B) -> Self {
        Self {
            first,
            second,
            _marker: PhantomData,
        }
    }
}

impl<I, M, O, A, B> Transform<I, O> for Chain<A, B, M>
where
    A: Transform<I, M>,
    B: Transform<M, O>,
    M: Send,
{
    fn apply(&self, input: I) -> Result<O> {
        self.first
            .apply(input)
            .and_then(|mid| self.second.apply(mid))
            .with_context(|| {
                format!(
                    "Transform chain failed: {} → {}",
                    std::any::type_name::<A>(),
                    std::any::type_name::<B>()
                )
            })
    }
}

/// Linearly maps every intensity image into `[out_min, out_max]`.
///
/// Label maps are left untouched. A constant image maps to `out_min`.
#[derive(Debug, Clone)]
pub struct RescaleIntensity {
    out_min: f32,
    out_max: f32,
}

impl RescaleIntensity {
    pub fn new(out_min: f32, out_max: f32) -> Result<Self> {
        ensure!(
            out_min < out_max,
            "Output range must be increasing, got [{}, {}]",
            out_min,
            out_max
        );
        Ok(Self { out_min, out_max })
    }
}

impl Transform<Subject, Subject> for RescaleIntensity {
    fn apply(&self, mut subject: Subject) -> Result<Subject> {
        for image in subject.images.values_mut() {
            if image.kind() != ImageKind::Intensity {
                continue;
            }
            let (lo, hi) = image
                .data()
                .iter()
                .fold((f32::INFINITY, f32::NEG_INFINITY), |(lo, hi), &v| {
                    (lo.min(v), hi.max(v))
                });
            let range = hi - lo;
            let scale = if range > 0.0 {
                (self.out_max - self.out_min) / range
            } else {
                0.0
            };
            let rescaled: Vec<f32> = image
                .data()
                .iter()
                .map(|&v| self.out_min + (v - lo) * scale)
                .collect();
            *image = Image::new(rescaled, image.shape(), image.kind())?;
        }
        Ok(subject)
    }
}
