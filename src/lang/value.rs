use serde::{Deserialize, Serialize};

/// Largest vector size a value can carry.
pub const MAX_VECTOR_SIZE: u8 = 4;

/// A float vector of 1 to 4 meaningful lanes.
///
/// Every value in the interpreter is four lanes wide, scalars included; `size`
/// says how many of them are meaningful. Lanes past `size` are kept at zero.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Value {
    pub lanes: [f32; 4],
    pub size: u8,
}

impl Default for Value {
    fn default() -> Self {
        Value::scalar(0.0)
    }
}

impl Value {
    pub const fn scalar(x: f32) -> Self {
        Value {
            lanes: [x, 0.0, 0.0, 0.0],
            size: 1,
        }
    }

    /// Builds a value from up to four components.
    pub fn from_slice(components: &[f32]) -> Self {
        let mut lanes = [0.0; 4];
        let size = components.len().min(4);
        lanes[..size].copy_from_slice(&components[..size]);
        Value {
            lanes,
            size: size as u8,
        }
    }

    /// `size` lanes all set to `x`.
    pub fn splat(x: f32, size: u8) -> Self {
        let mut lanes = [0.0; 4];
        for lane in lanes.iter_mut().take(size as usize) {
            *lane = x;
        }
        Value { lanes, size }
    }

    pub fn nan(size: u8) -> Self {
        Value::splat(f32::NAN, size.clamp(1, MAX_VECTOR_SIZE))
    }

    pub fn x(&self) -> f32 {
        self.lanes[0]
    }

    pub fn components(&self) -> &[f32] {
        &self.lanes[..self.size as usize]
    }

    /// Lane `i`, broadcasting scalars across all lanes.
    pub fn lane(&self, i: usize) -> f32 {
        if self.size == 1 { self.lanes[0] } else { self.lanes[i] }
    }

    pub fn map(&self, f: impl Fn(f32) -> f32) -> Value {
        let mut out = Value {
            lanes: [0.0; 4],
            size: self.size,
        };
        for i in 0..self.size as usize {
            out.lanes[i] = f(self.lanes[i]);
        }
        out
    }

    /// Lane-wise combination with scalar broadcasting.
    ///
    /// Returns `None` when both sides are vectors of different sizes.
    pub fn zip(&self, other: &Value, f: impl Fn(f32, f32) -> f32) -> Option<Value> {
        let size = broadcast_size(self.size, other.size)?;
        let mut out = Value {
            lanes: [0.0; 4],
            size,
        };
        for i in 0..size as usize {
            out.lanes[i] = f(self.lane(i), other.lane(i));
        }
        Some(out)
    }

    /// Appends the lanes of `other`; `None` when the result would exceed 4 lanes.
    pub fn grow(&self, other: &Value) -> Option<Value> {
        let size = self.size + other.size;
        if size > MAX_VECTOR_SIZE {
            return None;
        }
        let mut out = *self;
        for i in 0..other.size as usize {
            out.lanes[self.size as usize + i] = other.lanes[i];
        }
        out.size = size;
        Some(out)
    }

    pub fn negate(&self) -> Value {
        self.map(|x| -x)
    }

    /// Logical not per lane: 1 where the lane is zero.
    pub fn not(&self) -> Value {
        self.map(|x| bool_to_f32(x == 0.0))
    }

    /// True when any meaningful lane is non-zero.
    pub fn any(&self) -> bool {
        self.components().iter().any(|x| *x != 0.0)
    }

    /// True when every meaningful lane is non-zero.
    pub fn all(&self) -> bool {
        self.components().iter().all(|x| *x != 0.0)
    }

    pub fn sum(&self) -> f32 {
        self.components().iter().sum()
    }

    pub fn dot(&self, other: &Value) -> Option<f32> {
        let size = broadcast_size(self.size, other.size)?;
        Some((0..size as usize).map(|i| self.lane(i) * other.lane(i)).sum())
    }
}

impl std::fmt::Display for Value {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.size == 1 {
            return write!(f, "{}", self.lanes[0]);
        }
        write!(f, "(")?;
        for (i, x) in self.components().iter().enumerate() {
            if i > 0 {
                write!(f, " ")?;
            }
            write!(f, "{}", x)?;
        }
        write!(f, ")")
    }
}

/// Result size of a lane-wise operation between sizes `a` and `b`.
pub const fn broadcast_size(a: u8, b: u8) -> Option<u8> {
    if a == b {
        Some(a)
    } else if a == 1 {
        Some(b)
    } else if b == 1 {
        Some(a)
    } else {
        None
    }
}

pub const fn bool_to_f32(b: bool) -> f32 {
    if b { 1.0 } else { 0.0 }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_scalar_broadcast() {
        let v = Value::from_slice(&[1.0, 2.0, 3.0]);
        let r = v.zip(&Value::scalar(2.0), |a, b| a * b).unwrap();
        assert_eq!(r.components(), &[2.0, 4.0, 6.0]);
    }

    #[test]
    fn test_mismatched_sizes() {
        let a = Value::from_slice(&[1.0, 2.0]);
        let b = Value::from_slice(&[1.0, 2.0, 3.0]);
        assert!(a.zip(&b, |x, y| x + y).is_none());
    }

    #[test]
    fn test_grow_limit() {
        let a = Value::from_slice(&[1.0, 2.0, 3.0]);
        let grown = a.grow(&Value::scalar(4.0)).unwrap();
        assert_eq!(grown.size, 4);
        assert!(grown.grow(&Value::scalar(5.0)).is_none());
    }

    #[test]
    fn test_display() {
        assert_eq!(Value::scalar(7.0).to_string(), "7");
        assert_eq!(Value::from_slice(&[1.0, 2.5]).to_string(), "(1 2.5)");
    }
}
