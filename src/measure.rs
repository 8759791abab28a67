//! Simple zero-overhead unit of measure types
//!
//! Keeps distances, durations, angles and speeds apart by construction while
//! leaving the storage unit and numeric type visible in the type name.  The
//! geo math functions take and return these, and the public statistics
//! snapshot unwraps them into plain numbers at the serialization boundary.

use std::fmt::{Display, Formatter};
use std::ops::{Add, AddAssign, Div, Mul, Sub};

use approx::{AbsDiffEq, RelativeEq, relative_eq};
use num_traits::{Float, Num, NumCast};
use serde::Serialize;

macro_rules! unit_of_measure {
    ($u:ident, $suffix:expr) => {
        #[derive(Clone, Copy, Default, PartialEq, PartialOrd, Debug, Serialize)]
        #[serde(transparent)]
        pub struct $u<N: Num>(pub N);

        impl<N> Add for $u<N>
        where
            N: Num + Add,
        {
            type Output = Self;

            fn add(self, rhs: Self) -> Self {
                Self(self.0 + rhs.0)
            }
        }

        impl<N> AddAssign for $u<N>
        where
            N: Num + AddAssign,
        {
            fn add_assign(&mut self, rhs: Self) {
                self.0 += rhs.0;
            }
        }

        impl<N> Sub for $u<N>
        where
            N: Num + Sub,
        {
            type Output = Self;

            fn sub(self, rhs: Self) -> Self {
                Self(self.0 - rhs.0)
            }
        }

        impl<N> Div<N> for $u<N>
        where
            N: Num + Div,
        {
            type Output = Self;

            fn div(self, rhs: N) -> Self {
                Self(self.0 / rhs)
            }
        }

        impl<N> Mul<N> for $u<N>
        where
            N: Num + Mul,
        {
            type Output = Self;

            fn mul(self, rhs: N) -> Self {
                Self(self.0 * rhs)
            }
        }

        impl<N> $u<N>
        where
            N: Num + NumCast + Copy,
        {
            /// Casts the underlying value to another numeric type, if it
            /// fits.
            pub fn cast<M: Num + NumCast>(self) -> Option<$u<M>> {
                NumCast::from(self.0).map($u)
            }
        }

        impl<N> Display for $u<N>
        where
            N: Num + Display,
        {
            fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
                write!(f, "{}{}", self.0, $suffix)
            }
        }

        // Relative equality traits for appox support

        impl<N> AbsDiffEq for $u<N>
        where
            N: Num + Float + AbsDiffEq<N, Epsilon = N>,
        {
            type Epsilon = N;

            fn default_epsilon() -> Self::Epsilon {
                N::epsilon()
            }

            fn abs_diff_eq(&self, other: &Self, epsilon: Self::Epsilon) -> bool {
                self.0.abs_diff_eq(&other.0, epsilon)
            }
        }

        impl<N> RelativeEq for $u<N>
        where
            N: Num + Float + AbsDiffEq<N, Epsilon = N> + RelativeEq<N>,
        {
            fn default_max_relative() -> Self::Epsilon {
                N::epsilon()
            }

            fn relative_eq(
                &self,
                other: &Self,
                epsilon: Self::Epsilon,
                max_relative: Self::Epsilon,
            ) -> bool {
                relative_eq!(
                    self.0,
                    other.0,
                    epsilon = epsilon,
                    max_relative = max_relative
                )
            }
        }
    };
}

/// Conversions between two units of the same dimension, where one `$u` is
/// `$coeff` of `$base`.
macro_rules! unit_conversion {
    ($u:ident = $coeff:expr, $base:ident) => {
        impl From<$u<f64>> for $base<f64> {
            fn from(value: $u<f64>) -> Self {
                $base(value.0 * ($coeff))
            }
        }

        impl From<$base<f64>> for $u<f64> {
            fn from(value: $base<f64>) -> Self {
                $u(value.0 / ($coeff))
            }
        }
    };
}

macro_rules! unit_ratio_impl {
    ($ratio:ident, $num:ident, $denom:ident) => {
        impl<N> Div<$denom<N>> for $num<N>
        where
            N: Num + Div,
        {
            type Output = $ratio<N>;

            fn div(self, rhs: $denom<N>) -> Self::Output {
                $ratio(self.0 / rhs.0)
            }
        }

        impl<N> Mul<$denom<N>> for $ratio<N>
        where
            N: Num + Mul,
        {
            type Output = $num<N>;

            fn mul(self, rhs: $denom<N>) -> Self::Output {
                $num(self.0 * rhs.0)
            }
        }
    };
}

macro_rules! unit_ratio {
    ($ratio:ident, $num:ident, $denom:ident) => {
        unit_ratio_impl!($ratio, $num, $denom);
        unit_ratio_impl!($denom, $num, $ratio);
    };
}

// Time units:
unit_of_measure!(Seconds, "s");
unit_of_measure!(Hours, "h");
unit_conversion!(Hours = 3600.0, Seconds);

// Distance units:
unit_of_measure!(Meters, "m");
unit_of_measure!(Kilometers, "km");
unit_conversion!(Kilometers = 1000.0, Meters);

// Angular units:
unit_of_measure!(Degrees, "°");
unit_of_measure!(Semicircles, "sc");

// Speed units:
unit_of_measure!(KilometersPerHour, "km/h");

unit_ratio![KilometersPerHour, Kilometers, Hours];

/// Number of semicircles in 180 degrees, as defined by the FIT protocol.
const SEMICIRCLES_PER_180_DEG: f64 = 2_147_483_648.0;

impl From<Semicircles<i32>> for Degrees<f64> {
    fn from(value: Semicircles<i32>) -> Self {
        Degrees(<f64 as From<i32>>::from(value.0) * (180.0 / SEMICIRCLES_PER_180_DEG))
    }
}

impl From<Degrees<f64>> for Semicircles<f64> {
    fn from(value: Degrees<f64>) -> Self {
        Semicircles(value.0 * (SEMICIRCLES_PER_180_DEG / 180.0))
    }
}
