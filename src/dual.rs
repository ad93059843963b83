use std::ops::{Add, Div, Mul, Neg, Sub};

use num_traits::Float;

/// A number carrying one partial derivative per differentiated argument
/// position. The broadcast bridge evaluates a user function once over duals
/// and reads the whole gradient row out of the result, instead of needing a
/// hand-written derivative rule for that function.
#[derive(Clone, Debug, PartialEq)]
pub struct Dual<T: Float> {
    value: T,
    partials: Vec<T>,
}

impl<T: Float> Dual<T> {
    /// A dual with no sensitivity to any argument slot.
    pub fn constant(value: T, width: usize) -> Self {
        Self {
            value,
            partials: vec![T::zero(); width],
        }
    }

    /// A dual representing "the argument in slot `slot`": derivative one with
    /// respect to itself, zero with respect to every other slot.
    pub fn seeded(value: T, width: usize, slot: usize) -> Self {
        let mut partials = vec![T::zero(); width];
        partials[slot] = T::one();
        Self { value, partials }
    }

    pub fn value(&self) -> T {
        self.value
    }

    pub fn partial(&self, slot: usize) -> T {
        self.partials[slot]
    }

    pub fn width(&self) -> usize {
        self.partials.len()
    }

    /// Apply the chain rule for a unary function with the given primal result
    /// and local derivative.
    fn chain(&self, value: T, derivative: T) -> Self {
        Self {
            value,
            partials: self.partials.iter().map(|&p| p * derivative).collect(),
        }
    }

    pub fn exp(&self) -> Self {
        let e = self.value.exp();
        self.chain(e, e)
    }

    pub fn ln(&self) -> Self {
        self.chain(self.value.ln(), self.value.recip())
    }

    pub fn sqrt(&self) -> Self {
        let root = self.value.sqrt();
        self.chain(root, (root + root).recip())
    }

    pub fn recip(&self) -> Self {
        let r = self.value.recip();
        self.chain(r, -(r * r))
    }

    pub fn sin(&self) -> Self {
        self.chain(self.value.sin(), self.value.cos())
    }

    pub fn cos(&self) -> Self {
        self.chain(self.value.cos(), -self.value.sin())
    }

    pub fn tanh(&self) -> Self {
        let t = self.value.tanh();
        self.chain(t, T::one() - t * t)
    }

    pub fn powi(&self, exponent: i32) -> Self {
        self.chain(
            self.value.powi(exponent),
            T::from(exponent).expect("exponent should convert") * self.value.powi(exponent - 1),
        )
    }

    pub fn powf(&self, exponent: T) -> Self {
        self.chain(
            self.value.powf(exponent),
            exponent * self.value.powf(exponent - T::one()),
        )
    }
}

fn joint_width<T: Float>(a: &Dual<T>, b: &Dual<T>) -> usize {
    assert_eq!(a.width(), b.width(), "dual widths should agree");
    a.width()
}

impl<'a, 'b, T: Float> Add<&'b Dual<T>> for &'a Dual<T> {
    type Output = Dual<T>;

    fn add(self, other: &'b Dual<T>) -> Dual<T> {
        joint_width(self, other);
        Dual {
            value: self.value + other.value,
            partials: self
                .partials
                .iter()
                .zip(&other.partials)
                .map(|(&p, &q)| p + q)
                .collect(),
        }
    }
}

impl<'a, 'b, T: Float> Sub<&'b Dual<T>> for &'a Dual<T> {
    type Output = Dual<T>;

    fn sub(self, other: &'b Dual<T>) -> Dual<T> {
        joint_width(self, other);
        Dual {
            value: self.value - other.value,
            partials: self
                .partials
                .iter()
                .zip(&other.partials)
                .map(|(&p, &q)| p - q)
                .collect(),
        }
    }
}

impl<'a, 'b, T: Float> Mul<&'b Dual<T>> for &'a Dual<T> {
    type Output = Dual<T>;

    fn mul(self, other: &'b Dual<T>) -> Dual<T> {
        joint_width(self, other);
        // product rule: (ab)' = a'b + ab'
        Dual {
            value: self.value * other.value,
            partials: self
                .partials
                .iter()
                .zip(&other.partials)
                .map(|(&p, &q)| p * other.value + self.value * q)
                .collect(),
        }
    }
}

impl<'a, 'b, T: Float> Div<&'b Dual<T>> for &'a Dual<T> {
    type Output = Dual<T>;

    fn div(self, other: &'b Dual<T>) -> Dual<T> {
        joint_width(self, other);
        // quotient rule: (a/b)' = (a'b − ab')/b²
        let denominator = other.value * other.value;
        Dual {
            value: self.value / other.value,
            partials: self
                .partials
                .iter()
                .zip(&other.partials)
                .map(|(&p, &q)| (p * other.value - self.value * q) / denominator)
                .collect(),
        }
    }
}

impl<'a, T: Float> Neg for &'a Dual<T> {
    type Output = Dual<T>;

    fn neg(self) -> Dual<T> {
        Dual {
            value: -self.value,
            partials: self.partials.iter().map(|&p| -p).collect(),
        }
    }
}

impl<T: Float> Add for Dual<T> {
    type Output = Dual<T>;

    fn add(self, other: Dual<T>) -> Dual<T> {
        &self + &other
    }
}

impl<T: Float> Sub for Dual<T> {
    type Output = Dual<T>;

    fn sub(self, other: Dual<T>) -> Dual<T> {
        &self - &other
    }
}

impl<T: Float> Mul for Dual<T> {
    type Output = Dual<T>;

    fn mul(self, other: Dual<T>) -> Dual<T> {
        &self * &other
    }
}

impl<T: Float> Div for Dual<T> {
    type Output = Dual<T>;

    fn div(self, other: Dual<T>) -> Dual<T> {
        &self / &other
    }
}

impl<T: Float> Neg for Dual<T> {
    type Output = Dual<T>;

    fn neg(self) -> Dual<T> {
        -&self
    }
}

impl<'a, T: Float> Add<T> for &'a Dual<T> {
    type Output = Dual<T>;

    fn add(self, scalar: T) -> Dual<T> {
        Dual {
            value: self.value + scalar,
            partials: self.partials.clone(),
        }
    }
}

impl<'a, T: Float> Sub<T> for &'a Dual<T> {
    type Output = Dual<T>;

    fn sub(self, scalar: T) -> Dual<T> {
        Dual {
            value: self.value - scalar,
            partials: self.partials.clone(),
        }
    }
}

impl<'a, T: Float> Mul<T> for &'a Dual<T> {
    type Output = Dual<T>;

    fn mul(self, scalar: T) -> Dual<T> {
        self.chain(self.value * scalar, scalar)
    }
}

impl<'a, T: Float> Div<T> for &'a Dual<T> {
    type Output = Dual<T>;

    fn div(self, scalar: T) -> Dual<T> {
        self.chain(self.value / scalar, scalar.recip())
    }
}
