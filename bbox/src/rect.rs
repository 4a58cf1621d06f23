use super::TLBR;
use crate::common::*;

/// The generic axis-aligned rectangle in image coordinates.
///
/// `t`/`b` grow downwards and `l`/`r` grow rightwards, the way image rows and
/// columns are indexed.
pub trait Rect {
    type Type;

    fn t(&self) -> Self::Type;
    fn l(&self) -> Self::Type;
    fn b(&self) -> Self::Type;
    fn r(&self) -> Self::Type;
    fn h(&self) -> Self::Type;
    fn w(&self) -> Self::Type;

    fn try_from_tlbr(tlbr: [Self::Type; 4]) -> Result<Self>
    where
        Self: Sized;

    fn try_from_tlhw(tlhw: [Self::Type; 4]) -> Result<Self>
    where
        Self: Sized;

    /// Build from the `[x, y, w, h]` order used by COCO-style `bbox` arrays.
    fn try_from_xywh(xywh: [Self::Type; 4]) -> Result<Self>
    where
        Self: Sized;
}

pub trait RectNum: Rect
where
    Self::Type: Num + PartialOrd,
{
    fn tlbr(&self) -> [Self::Type; 4] {
        [self.t(), self.l(), self.b(), self.r()]
    }

    fn area(&self) -> <Self::Type as Mul<Self::Type>>::Output
    where
        Self::Type: Mul<Self::Type>,
    {
        self.h() * self.w()
    }
}

pub trait RectFloat: RectNum
where
    Self::Type: Float,
{
    /// Grow each side by a fraction of the rectangle's own extent.
    ///
    /// Left and right move by `ratio * w`, top and bottom by `ratio * h`.
    fn pad(&self, ratio: Self::Type) -> TLBR<Self::Type> {
        let pad_y = self.h() * ratio;
        let pad_x = self.w() * ratio;
        TLBR {
            t: self.t() - pad_y,
            l: self.l() - pad_x,
            b: self.b() + pad_y,
            r: self.r() + pad_x,
        }
    }
}

impl<T> RectNum for T
where
    T: Rect,
    T::Type: Num + PartialOrd,
{
}

impl<T> RectFloat for T
where
    T: Rect,
    T::Type: Float,
{
}
