//! Built-in function handlers.
//!
//! Every handler has the same shape: evaluated parameters and the vector
//! width the call works on in, result out. The table is built once and
//! indexed by the byte a built-in compiles to.

use std::sync::OnceLock;

use rand::Rng;

use crate::builtins::Emit;
use crate::bytecode::op::{ExtendedOp, ScriptOp};
use crate::lang::value::{Value, bool_to_f32};
use crate::runtime::vm::Executor;

pub type Handler = fn(&mut Executor<'_>, &[Value], u8) -> Value;

/// Extended operations are stored after the 64 script operation entries.
const EXTENDED_BASE: usize = 64;
const TABLE_SIZE: usize = EXTENDED_BASE + 32;

fn index(emit: Emit) -> usize {
    match emit {
        Emit::Op(op) => op.byte() as usize,
        Emit::Ex(ex) => EXTENDED_BASE + ex.byte() as usize,
    }
}

/// Handler of the built-in that compiles to `emit`.
pub fn handler(emit: Emit) -> Option<Handler> {
    static TABLE: OnceLock<[Option<Handler>; TABLE_SIZE]> = OnceLock::new();
    TABLE.get_or_init(build)[index(emit)]
}

fn build() -> [Option<Handler>; TABLE_SIZE] {
    use ExtendedOp as X;
    use ScriptOp as S;

    let entries: &[(Emit, Handler)] = &[
        (Emit::Op(S::Abs), |_, a, w| unary(a, w, f32::abs)),
        (Emit::Op(S::Min), |_, a, w| fold(a, w, f32::min)),
        (Emit::Op(S::Max), |_, a, w| fold(a, w, f32::max)),
        (Emit::Op(S::MinA), |_, a, _| reduce(a, f32::INFINITY, f32::min)),
        (Emit::Op(S::MaxA), |_, a, _| reduce(a, f32::NEG_INFINITY, f32::max)),
        (Emit::Op(S::Sqrt), |_, a, w| unary(a, w, f32::sqrt)),
        (Emit::Op(S::RSqrt), |_, a, w| unary(a, w, |x| 1.0 / x.sqrt())),
        (Emit::Op(S::Sin), |_, a, w| unary(a, w, f32::sin)),
        (Emit::Op(S::Cos), |_, a, w| unary(a, w, f32::cos)),
        (Emit::Op(S::Tan), |_, a, w| unary(a, w, f32::tan)),
        (Emit::Op(S::Atan), |_, a, w| unary(a, w, f32::atan)),
        (Emit::Op(S::Lerp), |_, a, w| ternary(a, w, |x, y, t| x + (y - x) * t)),
        (Emit::Op(S::Slerp), |_, a, _| slerp(&a[0], &a[1], a[2].x())),
        (Emit::Op(S::Normalize), |_, a, _| normalize(&a[0])),
        (Emit::Op(S::Clamp), |_, a, w| ternary(a, w, |x, lo, hi| x.max(lo).min(hi))),
        (Emit::Op(S::Saturate), |_, a, w| unary(a, w, |x| x.clamp(0.0, 1.0))),
        (Emit::Op(S::Pow), |_, a, w| binary(a, w, f32::powf)),
        (Emit::Op(S::Distance), |_, a, w| Value::scalar(distance_sq(a, w).sqrt())),
        (Emit::Op(S::Length), |_, a, w| Value::scalar(length_sq(&a[0], w).sqrt())),
        (Emit::Op(S::Exp), |_, a, w| unary(a, w, f32::exp)),
        (Emit::Op(S::Cross), |_, a, _| cross(&a[0], &a[1])),
        (Emit::Op(S::Dot), |_, a, w| Value::scalar(dot(&a[0], &a[1], w))),
        (Emit::Op(S::Select), |_, a, w| ternary(a, w, |x, y, c| if c != 0.0 { y } else { x })),
        (Emit::Op(S::Random), random),
        (Emit::Op(S::Fma), |_, a, w| ternary(a, w, |x, y, z| x * y + z)),
        (Emit::Op(S::Fms), |_, a, w| ternary(a, w, |x, y, z| x * y - z)),
        (Emit::Op(S::Fsm), |_, a, w| ternary(a, w, |x, y, z| x - y * z)),
        (Emit::Op(S::MulA), |_, a, w| fold(a, w, |x, y| x * y)),
        (Emit::Op(S::AddA), |_, a, w| fold(a, w, |x, y| x + y)),
        (Emit::Op(S::SubA), |_, a, w| fold(a, w, |x, y| x - y)),
        (Emit::Op(S::DivA), |_, a, w| fold(a, w, |x, y| x / y)),
        (Emit::Op(S::Any), |_, a, _| {
            Value::scalar(bool_to_f32(a.iter().any(Value::any)))
        }),
        (Emit::Op(S::All), |_, a, _| {
            Value::scalar(bool_to_f32(a.iter().all(Value::all)))
        }),
        (Emit::Ex(X::Log2), |_, a, w| unary(a, w, f32::log2)),
        (Emit::Ex(X::Log10), |_, a, w| unary(a, w, f32::log10)),
        (Emit::Ex(X::Logn), |_, a, w| unary(a, w, f32::ln)),
        (Emit::Ex(X::Exp10), |_, a, w| unary(a, w, |x| 10f32.powf(x))),
        (Emit::Ex(X::Sinh), |_, a, w| unary(a, w, f32::sinh)),
        (Emit::Ex(X::Cosh), |_, a, w| unary(a, w, f32::cosh)),
        (Emit::Ex(X::Atan2), |_, a, w| binary(a, w, f32::atan2)),
        (Emit::Ex(X::Ceil), |_, a, w| unary(a, w, f32::ceil)),
        (Emit::Ex(X::Floor), |_, a, w| unary(a, w, f32::floor)),
        (Emit::Ex(X::Frac), |_, a, w| unary(a, w, |x| x - x.floor())),
        (Emit::Ex(X::Degrees), |_, a, w| unary(a, w, f32::to_degrees)),
        (Emit::Ex(X::Radians), |_, a, w| unary(a, w, f32::to_radians)),
        (Emit::Ex(X::LengthSq), |_, a, w| Value::scalar(length_sq(&a[0], w))),
        (Emit::Ex(X::DistanceSq), |_, a, w| Value::scalar(distance_sq(a, w))),
    ];

    let mut table: [Option<Handler>; TABLE_SIZE] = [None; TABLE_SIZE];
    for (emit, handler) in entries {
        table[index(*emit)] = Some(*handler);
    }
    table
}

fn lanes(width: u8, f: impl Fn(usize) -> f32) -> Value {
    let mut out = Value {
        lanes: [0.0; 4],
        size: width,
    };
    for i in 0..width as usize {
        out.lanes[i] = f(i);
    }
    out
}

fn unary(args: &[Value], width: u8, f: impl Fn(f32) -> f32) -> Value {
    lanes(width, |i| f(args[0].lane(i)))
}

fn binary(args: &[Value], width: u8, f: impl Fn(f32, f32) -> f32) -> Value {
    lanes(width, |i| f(args[0].lane(i), args[1].lane(i)))
}

fn ternary(args: &[Value], width: u8, f: impl Fn(f32, f32, f32) -> f32) -> Value {
    lanes(width, |i| f(args[0].lane(i), args[1].lane(i), args[2].lane(i)))
}

/// Left fold over every parameter, lane by lane.
fn fold(args: &[Value], width: u8, f: impl Fn(f32, f32) -> f32) -> Value {
    lanes(width, |i| {
        args.iter()
            .skip(1)
            .fold(args[0].lane(i), |acc, v| f(acc, v.lane(i)))
    })
}

/// Fold over every component of every parameter into a scalar.
fn reduce(args: &[Value], init: f32, f: impl Fn(f32, f32) -> f32) -> Value {
    let result = args
        .iter()
        .flat_map(|v| v.components().iter().copied())
        .fold(init, f);
    Value::scalar(result)
}

fn dot(a: &Value, b: &Value, width: u8) -> f32 {
    (0..width as usize).map(|i| a.lane(i) * b.lane(i)).sum()
}

fn length_sq(a: &Value, width: u8) -> f32 {
    dot(a, a, width)
}

fn distance_sq(args: &[Value], width: u8) -> f32 {
    (0..width as usize)
        .map(|i| {
            let d = args[0].lane(i) - args[1].lane(i);
            d * d
        })
        .sum()
}

fn normalize(v: &Value) -> Value {
    let length = length_sq(v, v.size).sqrt();
    v.map(|x| x / length)
}

/// xyz cross product; w is 0.
fn cross(a: &Value, b: &Value) -> Value {
    let [ax, ay, az, _] = a.lanes;
    let [bx, by, bz, _] = b.lanes;
    Value {
        lanes: [ay * bz - az * by, az * bx - ax * bz, ax * by - ay * bx, 0.0],
        size: 4,
    }
}

/// Spherical interpolation of two quaternions.
fn slerp(a: &Value, b: &Value, t: f32) -> Value {
    let mut cos = dot(a, b, 4);
    let mut b = *b;
    if cos < 0.0 {
        b = b.negate();
        cos = -cos;
    }
    if cos > 0.9995 {
        let mixed = lanes(4, |i| a.lanes[i] + (b.lanes[i] - a.lanes[i]) * t);
        return normalize(&mixed);
    }
    let theta = cos.acos();
    let sin = theta.sin();
    let wa = ((1.0 - t) * theta).sin() / sin;
    let wb = (t * theta).sin() / sin;
    lanes(4, |i| a.lanes[i] * wa + b.lanes[i] * wb)
}

/// `random()` in [0, 1), `random(max)` in [0, max), `random(min, max)`.
fn random(executor: &mut Executor<'_>, args: &[Value], width: u8) -> Value {
    let (low, high) = match args {
        [] => (Value::scalar(0.0), Value::scalar(1.0)),
        [high] => (Value::scalar(0.0), *high),
        [low, high, ..] => (*low, *high),
    };
    let mut out = Value {
        lanes: [0.0; 4],
        size: width,
    };
    for i in 0..width as usize {
        let r: f32 = executor.rng.random();
        out.lanes[i] = low.lane(i) + (high.lane(i) - low.lane(i)) * r;
    }
    out
}
