//! Lane-wise instruction builder and the interpreter that runs its programs.
//!
//! Every value is a vector of 32-bit lanes. Floats are stored as their bit
//! patterns, integers as two's complement, and booleans as all-ones or zero
//! masks, so a select can treat any value as a predicate.

use crate::bail_codegen;
use crate::error::Result;
use std::collections::HashMap;
use std::fmt;

/// Handle to the result of one instruction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Val(u32);

impl Val {
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Display for Val {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "v{}", self.0)
    }
}

const TRUE_MASK: u32 = !0;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum UnaryOp {
    NegF,
    NegI,
    /// Bitwise complement; also logical not on masks.
    Not,
    /// Signed integer to float.
    ToF32,
    /// Float to signed integer, rounding toward zero.
    Trunc,
    AbsF,
    AbsI,
    Sqrt,
    Sin,
    Cos,
    Tan,
    Exp,
    Exp2,
    Log,
    Log2,
    Floor,
    Ceil,
    Fract,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BinaryOp {
    AddF,
    SubF,
    MulF,
    DivF,
    MinF,
    MaxF,
    PowF,
    AddI,
    SubI,
    MulI,
    MinI,
    MaxI,
    EqF,
    NeqF,
    LtF,
    LteF,
    GtF,
    GteF,
    EqI,
    NeqI,
    LtI,
    LteI,
    GtI,
    GteI,
    And,
    Or,
    Xor,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Instruction {
    /// The same raw bits in every lane.
    Splat(u32),
    /// A per-lane float supplied by the host.
    Argument(usize),
    /// A float supplied by the host, identical across lanes.
    Uniform(usize),
    Unary(UnaryOp, Val),
    Binary(BinaryOp, Val, Val),
    Select { cond: Val, if_true: Val, if_false: Val },
}

fn f(bits: u32) -> f32 {
    f32::from_bits(bits)
}

fn mask(value: bool) -> u32 {
    if value {
        TRUE_MASK
    } else {
        0
    }
}

impl UnaryOp {
    pub fn apply(self, a: u32) -> u32 {
        use UnaryOp::*;
        let float = |x: f32| x.to_bits();
        match self {
            NegF => float(-f(a)),
            NegI => (a as i32).wrapping_neg() as u32,
            Not => !a,
            ToF32 => float(a as i32 as f32),
            Trunc => f(a) as i32 as u32,
            AbsF => float(f(a).abs()),
            AbsI => (a as i32).wrapping_abs() as u32,
            Sqrt => float(f(a).sqrt()),
            Sin => float(f(a).sin()),
            Cos => float(f(a).cos()),
            Tan => float(f(a).tan()),
            Exp => float(f(a).exp()),
            Exp2 => float(f(a).exp2()),
            Log => float(f(a).ln()),
            Log2 => float(f(a).log2()),
            Floor => float(f(a).floor()),
            Ceil => float(f(a).ceil()),
            Fract => float(f(a) - f(a).floor()),
        }
    }
}

impl BinaryOp {
    pub fn apply(self, a: u32, b: u32) -> u32 {
        use BinaryOp::*;
        let float = |x: f32| x.to_bits();
        let (ia, ib) = (a as i32, b as i32);
        match self {
            AddF => float(f(a) + f(b)),
            SubF => float(f(a) - f(b)),
            MulF => float(f(a) * f(b)),
            DivF => float(f(a) / f(b)),
            MinF => float(f(a).min(f(b))),
            MaxF => float(f(a).max(f(b))),
            PowF => float(f(a).powf(f(b))),
            AddI => ia.wrapping_add(ib) as u32,
            SubI => ia.wrapping_sub(ib) as u32,
            MulI => ia.wrapping_mul(ib) as u32,
            MinI => ia.min(ib) as u32,
            MaxI => ia.max(ib) as u32,
            EqF => mask(f(a) == f(b)),
            NeqF => mask(f(a) != f(b)),
            LtF => mask(f(a) < f(b)),
            LteF => mask(f(a) <= f(b)),
            GtF => mask(f(a) > f(b)),
            GteF => mask(f(a) >= f(b)),
            EqI => mask(ia == ib),
            NeqI => mask(ia != ib),
            LtI => mask(ia < ib),
            LteI => mask(ia <= ib),
            GtI => mask(ia > ib),
            GteI => mask(ia >= ib),
            And => a & b,
            Or => a | b,
            Xor => a ^ b,
        }
    }
}

/// Accumulates instructions, sharing identical ones and folding operations
/// whose inputs are all splats.
#[derive(Debug, Default)]
pub struct Builder {
    instructions: Vec<Instruction>,
    existing: HashMap<Instruction, Val>,
    arguments: usize,
    uniforms: usize,
}

impl Builder {
    pub fn new() -> Self {
        Self::default()
    }

    fn push(&mut self, instruction: Instruction) -> Val {
        if let Some(val) = self.existing.get(&instruction) {
            return *val;
        }
        let val = Val(self.instructions.len() as u32);
        self.instructions.push(instruction);
        self.existing.insert(instruction, val);
        val
    }

    pub fn splat(&mut self, bits: u32) -> Val {
        self.push(Instruction::Splat(bits))
    }

    pub fn splat_f32(&mut self, value: f32) -> Val {
        self.splat(value.to_bits())
    }

    pub fn splat_i32(&mut self, value: i32) -> Val {
        self.splat(value as u32)
    }

    pub fn splat_bool(&mut self, value: bool) -> Val {
        self.splat(mask(value))
    }

    pub fn argument(&mut self, index: usize) -> Val {
        self.arguments = self.arguments.max(index + 1);
        self.push(Instruction::Argument(index))
    }

    pub fn uniform(&mut self, index: usize) -> Val {
        self.uniforms = self.uniforms.max(index + 1);
        self.push(Instruction::Uniform(index))
    }

    /// The bits of `val` if it is the same in every lane at build time.
    pub fn immediate(&self, val: Val) -> Option<u32> {
        match self.instructions[val.index()] {
            Instruction::Splat(bits) => Some(bits),
            _ => None,
        }
    }

    pub fn unary(&mut self, op: UnaryOp, x: Val) -> Val {
        if let Some(a) = self.immediate(x) {
            return self.splat(op.apply(a));
        }
        self.push(Instruction::Unary(op, x))
    }

    pub fn binary(&mut self, op: BinaryOp, x: Val, y: Val) -> Val {
        let (a, b) = (self.immediate(x), self.immediate(y));
        if let (Some(a), Some(b)) = (a, b) {
            return self.splat(op.apply(a, b));
        }
        match (op, a, b) {
            (BinaryOp::And, Some(TRUE_MASK), _) | (BinaryOp::Or, Some(0), _) => y,
            (BinaryOp::And, _, Some(TRUE_MASK)) | (BinaryOp::Or, _, Some(0)) => x,
            (BinaryOp::And, Some(0), _) | (BinaryOp::And, _, Some(0)) => self.splat(0),
            _ => self.push(Instruction::Binary(op, x, y)),
        }
    }

    pub fn select(&mut self, cond: Val, if_true: Val, if_false: Val) -> Val {
        if if_true == if_false {
            return if_true;
        }
        match self.immediate(cond) {
            Some(0) => if_false,
            Some(_) => if_true,
            None => self.push(Instruction::Select { cond, if_true, if_false }),
        }
    }

    pub fn not(&mut self, x: Val) -> Val {
        self.unary(UnaryOp::Not, x)
    }

    pub fn and(&mut self, x: Val, y: Val) -> Val {
        self.binary(BinaryOp::And, x, y)
    }

    pub fn or(&mut self, x: Val, y: Val) -> Val {
        self.binary(BinaryOp::Or, x, y)
    }

    pub fn add_f(&mut self, x: Val, y: Val) -> Val {
        self.binary(BinaryOp::AddF, x, y)
    }

    pub fn sub_f(&mut self, x: Val, y: Val) -> Val {
        self.binary(BinaryOp::SubF, x, y)
    }

    pub fn mul_f(&mut self, x: Val, y: Val) -> Val {
        self.binary(BinaryOp::MulF, x, y)
    }

    pub fn div_f(&mut self, x: Val, y: Val) -> Val {
        self.binary(BinaryOp::DivF, x, y)
    }

    pub fn len(&self) -> usize {
        self.instructions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.instructions.is_empty()
    }

    /// Finishes the program; `results` are the values handed back to the host.
    pub fn done(self, results: Vec<Val>) -> Program {
        Program {
            instructions: self.instructions,
            arguments: self.arguments,
            uniforms: self.uniforms,
            results,
        }
    }
}

/// A finished lane program.
#[derive(Debug, Clone, PartialEq)]
pub struct Program {
    instructions: Vec<Instruction>,
    arguments: usize,
    uniforms: usize,
    results: Vec<Val>,
}

impl Program {
    pub fn instructions(&self) -> &[Instruction] {
        &self.instructions
    }

    pub fn argument_count(&self) -> usize {
        self.arguments
    }

    pub fn uniform_count(&self) -> usize {
        self.uniforms
    }

    pub fn result_count(&self) -> usize {
        self.results.len()
    }

    /// Runs the program over `lanes` lanes. `args` holds one lane vector per
    /// argument slot and `uniforms` one value per uniform slot. Returns one
    /// lane vector per result slot.
    pub fn eval(&self, lanes: usize, args: &[Vec<f32>], uniforms: &[f32]) -> Result<Vec<Vec<f32>>> {
        if args.len() != self.arguments {
            bail_codegen!("program takes {} argument slots, got {}", self.arguments, args.len());
        }
        if let Some(arg) = args.iter().find(|arg| arg.len() != lanes) {
            bail_codegen!("argument has {} lanes, expected {}", arg.len(), lanes);
        }
        if uniforms.len() != self.uniforms {
            bail_codegen!("program takes {} uniform slots, got {}", self.uniforms, uniforms.len());
        }

        let mut values: Vec<Vec<u32>> = Vec::with_capacity(self.instructions.len());
        for instruction in &self.instructions {
            let lane_values = match *instruction {
                Instruction::Splat(bits) => vec![bits; lanes],
                Instruction::Argument(index) => args[index].iter().map(|x| x.to_bits()).collect(),
                Instruction::Uniform(index) => vec![uniforms[index].to_bits(); lanes],
                Instruction::Unary(op, x) => values[x.index()].iter().map(|&a| op.apply(a)).collect(),
                Instruction::Binary(op, x, y) => values[x.index()]
                    .iter()
                    .zip(&values[y.index()])
                    .map(|(&a, &b)| op.apply(a, b))
                    .collect(),
                Instruction::Select { cond, if_true, if_false } => {
                    let (c, t, e) = (&values[cond.index()], &values[if_true.index()], &values[if_false.index()]);
                    (0..lanes).map(|lane| if c[lane] != 0 { t[lane] } else { e[lane] }).collect()
                }
            };
            values.push(lane_values);
        }

        Ok(self
            .results
            .iter()
            .map(|val| values[val.index()].iter().map(|&bits| f32::from_bits(bits)).collect())
            .collect())
    }
}

impl fmt::Display for Program {
    fn fmt(&self, out: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (index, instruction) in self.instructions.iter().enumerate() {
            write!(out, "v{} = ", index)?;
            match instruction {
                Instruction::Splat(bits) => writeln!(out, "splat {:#010x} ({})", bits, f(*bits))?,
                Instruction::Argument(i) => writeln!(out, "argument {}", i)?,
                Instruction::Uniform(i) => writeln!(out, "uniform {}", i)?,
                Instruction::Unary(op, x) => writeln!(out, "{:?} {}", op, x)?,
                Instruction::Binary(op, x, y) => writeln!(out, "{:?} {} {}", op, x, y)?,
                Instruction::Select { cond, if_true, if_false } => {
                    writeln!(out, "select {} {} {}", cond, if_true, if_false)?
                }
            }
        }
        let results: Vec<String> = self.results.iter().map(Val::to_string).collect();
        writeln!(out, "results {}", results.join(" "))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_identical_instructions_are_shared() {
        let mut b = Builder::new();
        let x = b.argument(0);
        let two = b.splat_f32(2.0);
        let first = b.mul_f(x, two);
        let second = b.mul_f(x, two);
        assert_eq!(first, second);
        assert_eq!(b.len(), 3);
    }

    #[test]
    fn test_splats_fold() {
        let mut b = Builder::new();
        let two = b.splat_f32(2.0);
        let three = b.splat_f32(3.0);
        let six = b.mul_f(two, three);
        assert_eq!(b.immediate(six), Some(6.0f32.to_bits()));
        let t = b.splat_bool(true);
        let x = b.argument(0);
        assert_eq!(b.and(t, x), x);
        assert_eq!(b.select(t, x, two), x);
    }

    #[test]
    fn test_eval_selects_per_lane() {
        let mut b = Builder::new();
        let x = b.argument(0);
        let limit = b.splat_f32(2.0);
        let big = b.binary(BinaryOp::GtF, x, limit);
        let hundred = b.splat_f32(100.0);
        let y = b.select(big, hundred, x);
        let program = b.done(vec![y]);
        let out = program.eval(4, &[vec![1.0, 2.0, 3.0, 4.0]], &[]).unwrap();
        assert_eq!(out, vec![vec![1.0, 2.0, 100.0, 100.0]]);
    }

    #[test]
    fn test_integer_ops_wrap_and_truncate() {
        assert_eq!(UnaryOp::Trunc.apply((-2.7f32).to_bits()) as i32, -2);
        assert_eq!(BinaryOp::AddI.apply(i32::MAX as u32, 1) as i32, i32::MIN);
        assert_eq!(BinaryOp::LtI.apply((-1i32) as u32, 0), TRUE_MASK);
    }

    #[test]
    fn test_eval_checks_inputs() {
        let mut b = Builder::new();
        let x = b.argument(0);
        let u = b.uniform(0);
        let sum = b.add_f(x, u);
        let program = b.done(vec![sum]);
        assert!(program.eval(2, &[], &[1.0]).is_err());
        assert!(program.eval(2, &[vec![1.0]], &[1.0]).is_err());
        assert!(program.eval(2, &[vec![1.0, 2.0]], &[]).is_err());
        assert_eq!(program.eval(2, &[vec![1.0, 2.0]], &[0.5]).unwrap(), vec![vec![1.5, 2.5]]);
    }
}
