//! A small CIL interpreter.
//!
//! Runs a [`MethodBody`] on concrete arguments so tests can compare what a body
//! does before and after it was transformed. Supports the opcodes the engine
//! emits plus a handful of well-known calls:
//!
//! - [`CONCAT`]: `string Concat(string, string)`
//! - [`TRACE`]: `void Trace(object)`, appends to the execution trace
//! - [`EXCEPTION_CTOR`]: `Exception(string)`
//!
//! Native stubs are executed with [`super::run_x86_stub`].

use std::{cmp::Ordering, collections::HashMap};

use crate::{
    cil::{CallTarget, HandlerKind, InstrId, Instruction, MethodBody, OpCode, Operand, Token, TypeSig},
    test::run_x86_stub,
    virtualization::NativeStub,
    Result,
};

/// `string Concat(string, string)`
pub const CONCAT: Token = Token(0x0A00_0001);
/// `void Trace(object)`
pub const TRACE: Token = Token(0x0A00_0002);
/// `Exception::.ctor(string)`
pub const EXCEPTION_CTOR: Token = Token(0x0A00_0003);

/// `System.Exception`, base of all exceptions below
pub const EXCEPTION: Token = Token(0x0100_0001);
/// `System.DivideByZeroException`
pub const DIVIDE_BY_ZERO: Token = Token(0x0100_0002);
/// `System.NullReferenceException`
pub const NULL_REFERENCE: Token = Token(0x0100_0003);
/// `System.InvalidCastException`
pub const INVALID_CAST: Token = Token(0x0100_0004);
/// `System.IndexOutOfRangeException`
pub const INDEX_OUT_OF_RANGE: Token = Token(0x0100_0005);

const FUEL: usize = 200_000;

/// A runtime value.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Null,
    I32(i32),
    I64(i64),
    F64(f64),
    Str(String),
    Boxed(Box<Value>),
    /// Index into the interpreter's array heap
    Array(usize),
    Exception { kind: Token, message: String },
}

impl Value {
    fn truthy(&self) -> bool {
        match self {
            Value::Null => false,
            Value::I32(v) => *v != 0,
            Value::I64(v) => *v != 0,
            Value::F64(v) => *v != 0.0,
            _ => true,
        }
    }

    fn default_for(ty: &TypeSig) -> Value {
        match ty {
            TypeSig::Boolean | TypeSig::Int32 | TypeSig::UInt32 => Value::I32(0),
            TypeSig::Int64 => Value::I64(0),
            TypeSig::Float32 | TypeSig::Float64 => Value::F64(0.0),
            _ => Value::Null,
        }
    }
}

/// How a method run ended.
#[derive(Debug, Clone, PartialEq)]
pub enum Outcome {
    Returned(Option<Value>),
    Threw(Value),
}

/// Runs `body` and returns how it ended.
pub fn run(body: &MethodBody, args: &[Value], stubs: &[NativeStub]) -> Result<Outcome> {
    execute(body, args, stubs).map(|(outcome, _)| outcome)
}

/// Runs `body` and returns how it ended together with everything passed to [`TRACE`].
pub fn execute(
    body: &MethodBody,
    args: &[Value],
    stubs: &[NativeStub],
) -> Result<(Outcome, Vec<Value>)> {
    let mut machine = Machine::new(body, args, stubs)?;
    let outcome = match machine.block(0, Vec::new(), false)? {
        Exit::Return(value) => Outcome::Returned(value),
        Exit::Throw(value) => Outcome::Threw(value),
        Exit::EndFinally | Exit::EndFilter(_) => {
            return Err(malformed_error!("endfinally / endfilter outside of a handler"))
        }
    };
    Ok((outcome, machine.trace))
}

fn exception(kind: Token, message: &str) -> Value {
    Value::Exception {
        kind,
        message: message.to_string(),
    }
}

enum ClauseKind {
    Catch(TypeSig),
    Filter(usize),
    Finally,
    Fault,
}

struct Clause {
    kind: ClauseKind,
    try_start: usize,
    try_end: usize,
    handler_start: usize,
}

impl Clause {
    fn covers(&self, pos: usize) -> bool {
        (self.try_start..self.try_end).contains(&pos)
    }

    fn catches(&self, value: &Value) -> bool {
        let ClauseKind::Catch(ty) = &self.kind else {
            return false;
        };
        match (ty, value) {
            (TypeSig::Object, _) => true,
            (TypeSig::Class(class), Value::Exception { kind, .. }) => {
                *class == EXCEPTION || class == kind
            }
            _ => false,
        }
    }
}

enum Exit {
    Return(Option<Value>),
    EndFinally,
    EndFilter(Value),
    Throw(Value),
}

enum Step {
    Next,
    Jump(usize),
    Leave(usize),
    Return,
    EndFinally,
    EndFilter,
    Throw(Value),
}

struct Machine<'a> {
    code: Vec<&'a Instruction>,
    positions: HashMap<InstrId, usize>,
    clauses: Vec<Clause>,
    stubs: &'a [NativeStub],
    args: Vec<Value>,
    locals: Vec<Value>,
    arrays: Vec<Vec<Value>>,
    statics: HashMap<Token, Value>,
    caught: Option<Value>,
    trace: Vec<Value>,
    fuel: usize,
}

impl<'a> Machine<'a> {
    fn new(body: &'a MethodBody, args: &[Value], stubs: &'a [NativeStub]) -> Result<Self> {
        let code: Vec<&Instruction> = body.iter().map(|(_, i)| i).collect();
        let positions = body.positions();
        let count = code.len();
        let pos = |id: InstrId| {
            positions
                .get(&id)
                .copied()
                .ok_or_else(|| malformed_error!("dangling reference {}", id))
        };
        let end = |id: Option<InstrId>| id.map_or(Ok(count), pos);

        let mut clauses = Vec::new();
        for eh in &body.exception_handlers {
            clauses.push(Clause {
                kind: match &eh.kind {
                    HandlerKind::Catch(ty) => ClauseKind::Catch(ty.clone()),
                    HandlerKind::Filter(start) => ClauseKind::Filter(pos(*start)?),
                    HandlerKind::Finally => ClauseKind::Finally,
                    HandlerKind::Fault => ClauseKind::Fault,
                },
                try_start: pos(eh.try_start)?,
                try_end: end(eh.try_end)?,
                handler_start: pos(eh.handler_start)?,
            });
        }

        Ok(Machine {
            code,
            positions,
            clauses,
            stubs,
            args: args.to_vec(),
            locals: body.locals.iter().map(|l| Value::default_for(&l.ty)).collect(),
            arrays: Vec::new(),
            statics: HashMap::new(),
            caught: None,
            trace: Vec::new(),
            fuel: FUEL,
        })
    }

    fn pos(&self, id: InstrId) -> Result<usize> {
        self.positions
            .get(&id)
            .copied()
            .ok_or_else(|| malformed_error!("branch to missing instruction {}", id))
    }

    /// Runs from `pc` until the block exits. Subroutines (finally, fault and
    /// filter blocks) hand exceptions straight back to their caller.
    fn block(&mut self, mut pc: usize, mut stack: Vec<Value>, subroutine: bool) -> Result<Exit> {
        loop {
            if self.fuel == 0 {
                return Err(malformed_error!("out of fuel at {}", pc));
            }
            self.fuel -= 1;

            let step = self.step(pc, &mut stack)?;
            let thrown = match step {
                Step::Next => {
                    pc += 1;
                    continue;
                }
                Step::Jump(target) => {
                    pc = target;
                    continue;
                }
                Step::Leave(target) => {
                    stack.clear();
                    match self.run_finallys(pc, target)? {
                        None => {
                            pc = target;
                            continue;
                        }
                        Some(thrown) => thrown,
                    }
                }
                Step::Return => return Ok(Exit::Return(stack.pop())),
                Step::EndFinally => return Ok(Exit::EndFinally),
                Step::EndFilter => {
                    let verdict = pop(&mut stack)?;
                    return Ok(Exit::EndFilter(verdict));
                }
                Step::Throw(value) => value,
            };

            if subroutine {
                return Ok(Exit::Throw(thrown));
            }
            match self.dispatch(pc, thrown)? {
                Ok((handler, value)) => {
                    self.caught = Some(value.clone());
                    stack = vec![value];
                    pc = handler;
                }
                Err(unhandled) => return Ok(Exit::Throw(unhandled)),
            }
        }
    }

    /// Runs the finally blocks of every region that `leave` at `from` exits.
    fn run_finallys(&mut self, from: usize, to: usize) -> Result<Option<Value>> {
        let starts: Vec<usize> = self
            .clauses
            .iter()
            .filter(|c| matches!(c.kind, ClauseKind::Finally) && c.covers(from) && !c.covers(to))
            .map(|c| c.handler_start)
            .collect();
        for start in starts {
            match self.block(start, Vec::new(), true)? {
                Exit::EndFinally => {}
                Exit::Throw(value) => return Ok(Some(value)),
                _ => return Err(malformed_error!("finally block at {} did not end", start)),
            }
        }
        Ok(None)
    }

    /// Finds the handler for an exception raised at `pc`, running the finally
    /// and fault blocks it passes on the way. Returns the unhandled exception
    /// if no clause takes it.
    fn dispatch(
        &mut self,
        pc: usize,
        thrown: Value,
    ) -> Result<std::result::Result<(usize, Value), Value>> {
        let covering: Vec<usize> = (0..self.clauses.len())
            .filter(|i| self.clauses[*i].covers(pc))
            .collect();

        let mut chosen = None;
        for (n, &index) in covering.iter().enumerate() {
            let clause = &self.clauses[index];
            if clause.catches(&thrown) {
                chosen = Some(n);
                break;
            }
            if let ClauseKind::Filter(start) = clause.kind {
                if let Exit::EndFilter(verdict) = self.block(start, vec![thrown.clone()], true)? {
                    if verdict.truthy() {
                        chosen = Some(n);
                        break;
                    }
                }
            }
        }

        let passed = chosen.unwrap_or(covering.len());
        for &index in &covering[..passed] {
            let clause = &self.clauses[index];
            if matches!(clause.kind, ClauseKind::Finally | ClauseKind::Fault) {
                let start = clause.handler_start;
                match self.block(start, Vec::new(), true)? {
                    Exit::EndFinally => {}
                    Exit::Throw(value) => return Ok(Err(value)),
                    _ => return Err(malformed_error!("handler at {} did not end", start)),
                }
            }
        }

        Ok(match chosen {
            Some(n) => Ok((self.clauses[covering[n]].handler_start, thrown)),
            None => Err(thrown),
        })
    }

    fn step(&mut self, pc: usize, stack: &mut Vec<Value>) -> Result<Step> {
        let instr = *self
            .code
            .get(pc)
            .ok_or_else(|| malformed_error!("fell off the end at {}", pc))?;

        let step = match (instr.opcode, &instr.operand) {
            (OpCode::Nop, _) => Step::Next,
            (OpCode::Ldarg, Operand::Argument(n)) => {
                let value = self
                    .args
                    .get(*n as usize)
                    .cloned()
                    .ok_or_else(|| malformed_error!("missing argument {}", n))?;
                stack.push(value);
                Step::Next
            }
            (OpCode::Starg, Operand::Argument(n)) => {
                let value = pop(stack)?;
                let slot = self
                    .args
                    .get_mut(*n as usize)
                    .ok_or_else(|| malformed_error!("missing argument {}", n))?;
                *slot = value;
                Step::Next
            }
            (OpCode::Ldloc, Operand::Local(local)) => {
                let value = self
                    .locals
                    .get(local.index())
                    .cloned()
                    .ok_or_else(|| malformed_error!("missing local {}", local.0))?;
                stack.push(value);
                Step::Next
            }
            (OpCode::Stloc, Operand::Local(local)) => {
                let value = pop(stack)?;
                let slot = self
                    .locals
                    .get_mut(local.index())
                    .ok_or_else(|| malformed_error!("missing local {}", local.0))?;
                *slot = value;
                Step::Next
            }
            (OpCode::Ldnull, _) => {
                stack.push(Value::Null);
                Step::Next
            }
            (OpCode::LdcI4, Operand::Int32(v)) => {
                stack.push(Value::I32(*v));
                Step::Next
            }
            (OpCode::LdcI8, Operand::Int64(v)) => {
                stack.push(Value::I64(*v));
                Step::Next
            }
            (OpCode::LdcR4, Operand::Float32(v)) => {
                stack.push(Value::F64(f64::from(*v)));
                Step::Next
            }
            (OpCode::LdcR8, Operand::Float64(v)) => {
                stack.push(Value::F64(*v));
                Step::Next
            }
            (OpCode::Ldstr, Operand::String(s)) => {
                stack.push(Value::Str(s.clone()));
                Step::Next
            }
            (OpCode::Dup, _) => {
                let value = pop(stack)?;
                stack.push(value.clone());
                stack.push(value);
                Step::Next
            }
            (OpCode::Pop, _) => {
                pop(stack)?;
                Step::Next
            }

            (OpCode::Call | OpCode::Callvirt, Operand::Method(method)) => match method.target {
                CallTarget::NativeStub(id) => {
                    let arg = pop_i32(stack)?;
                    let stub = self
                        .stubs
                        .iter()
                        .find(|s| s.id == id)
                        .ok_or_else(|| malformed_error!("unknown native stub {}", id))?;
                    let result = run_x86_stub(&stub.code, arg as u32)
                        .ok_or_else(|| malformed_error!("native stub {} failed", id))?;
                    stack.push(Value::I32(result as i32));
                    Step::Next
                }
                CallTarget::Token(CONCAT) => {
                    let b = pop(stack)?;
                    let a = pop(stack)?;
                    stack.push(Value::Str(format!("{}{}", text(&a)?, text(&b)?)));
                    Step::Next
                }
                CallTarget::Token(TRACE) => {
                    let value = pop(stack)?;
                    self.trace.push(value);
                    Step::Next
                }
                CallTarget::Token(other) => {
                    return Err(malformed_error!("no implementation for {}", other))
                }
            },
            (OpCode::Newobj, Operand::Method(method)) => match method.target {
                CallTarget::Token(EXCEPTION_CTOR) => {
                    let message = pop(stack)?;
                    stack.push(exception(EXCEPTION, &text(&message)?));
                    Step::Next
                }
                _ => return Err(malformed_error!("no constructor for {}", instr)),
            },
            (OpCode::Ret, _) => Step::Return,

            (OpCode::Br, Operand::Target(t)) => Step::Jump(self.pos(*t)?),
            (OpCode::Leave, Operand::Target(t)) => Step::Leave(self.pos(*t)?),
            (OpCode::Brtrue | OpCode::Brfalse, Operand::Target(t)) => {
                let value = pop(stack)?;
                if value.truthy() == (instr.opcode == OpCode::Brtrue) {
                    Step::Jump(self.pos(*t)?)
                } else {
                    Step::Next
                }
            }
            (
                op @ (OpCode::Beq
                | OpCode::Bge
                | OpCode::Bgt
                | OpCode::Ble
                | OpCode::Blt
                | OpCode::BneUn
                | OpCode::BgeUn
                | OpCode::BgtUn
                | OpCode::BleUn
                | OpCode::BltUn),
                Operand::Target(t),
            ) => {
                let b = pop(stack)?;
                let a = pop(stack)?;
                if branch_taken(op, &a, &b)? {
                    Step::Jump(self.pos(*t)?)
                } else {
                    Step::Next
                }
            }
            (OpCode::Switch, Operand::Switch(targets)) => {
                let index = pop_i32(stack)? as u32 as usize;
                match targets.get(index) {
                    Some(t) => Step::Jump(self.pos(*t)?),
                    None => Step::Next,
                }
            }

            (
                op @ (OpCode::Add
                | OpCode::Sub
                | OpCode::Mul
                | OpCode::Div
                | OpCode::DivUn
                | OpCode::Rem
                | OpCode::RemUn
                | OpCode::And
                | OpCode::Or
                | OpCode::Xor
                | OpCode::Shl
                | OpCode::Shr
                | OpCode::ShrUn),
                _,
            ) => {
                let b = pop(stack)?;
                let a = pop(stack)?;
                match binary(op, &a, &b)? {
                    Some(value) => {
                        stack.push(value);
                        Step::Next
                    }
                    None => Step::Throw(exception(DIVIDE_BY_ZERO, "Attempted to divide by zero.")),
                }
            }
            (OpCode::Neg, _) => {
                let value = match pop(stack)? {
                    Value::I32(v) => Value::I32(v.wrapping_neg()),
                    Value::I64(v) => Value::I64(v.wrapping_neg()),
                    Value::F64(v) => Value::F64(-v),
                    other => return Err(malformed_error!("neg on {:?}", other)),
                };
                stack.push(value);
                Step::Next
            }
            (OpCode::Not, _) => {
                let value = match pop(stack)? {
                    Value::I32(v) => Value::I32(!v),
                    Value::I64(v) => Value::I64(!v),
                    other => return Err(malformed_error!("not on {:?}", other)),
                };
                stack.push(value);
                Step::Next
            }
            (
                op @ (OpCode::Ceq | OpCode::Cgt | OpCode::CgtUn | OpCode::Clt | OpCode::CltUn),
                _,
            ) => {
                let b = pop(stack)?;
                let a = pop(stack)?;
                let result = match op {
                    OpCode::Ceq => a == b,
                    OpCode::Cgt => ordering(&a, &b, false)? == Some(Ordering::Greater),
                    OpCode::CgtUn => {
                        matches!(ordering(&a, &b, true)?, Some(Ordering::Greater) | None)
                    }
                    OpCode::Clt => ordering(&a, &b, false)? == Some(Ordering::Less),
                    _ => matches!(ordering(&a, &b, true)?, Some(Ordering::Less) | None),
                };
                stack.push(Value::I32(i32::from(result)));
                Step::Next
            }

            (op @ (OpCode::ConvI4 | OpCode::ConvU4 | OpCode::ConvI8 | OpCode::ConvR8), _) => {
                let value = pop(stack)?;
                stack.push(convert(op, &value)?);
                Step::Next
            }

            (OpCode::Newarr, Operand::Type(ty)) => {
                let count = usize::try_from(pop_i32(stack)?)
                    .map_err(|_| malformed_error!("negative array size"))?;
                self.arrays.push(vec![Value::default_for(ty); count]);
                stack.push(Value::Array(self.arrays.len() - 1));
                Step::Next
            }
            (OpCode::Ldlen, _) => match pop(stack)? {
                Value::Array(a) => {
                    stack.push(Value::I32(self.arrays[a].len() as i32));
                    Step::Next
                }
                Value::Null => Step::Throw(null_reference()),
                other => return Err(malformed_error!("ldlen on {:?}", other)),
            },
            (OpCode::LdelemRef | OpCode::LdelemI4 | OpCode::LdelemU4, _) => {
                let index = pop_i32(stack)?;
                match pop(stack)? {
                    Value::Array(a) => match usize::try_from(index)
                        .ok()
                        .and_then(|i| self.arrays[a].get(i))
                    {
                        Some(value) => {
                            stack.push(value.clone());
                            Step::Next
                        }
                        None => Step::Throw(index_out_of_range()),
                    },
                    Value::Null => Step::Throw(null_reference()),
                    other => return Err(malformed_error!("ldelem on {:?}", other)),
                }
            }
            (OpCode::StelemRef | OpCode::StelemI4, _) => {
                let value = pop(stack)?;
                let index = pop_i32(stack)?;
                match pop(stack)? {
                    Value::Array(a) => match usize::try_from(index)
                        .ok()
                        .and_then(|i| self.arrays[a].get_mut(i))
                    {
                        Some(slot) => {
                            *slot = value;
                            Step::Next
                        }
                        None => Step::Throw(index_out_of_range()),
                    },
                    Value::Null => Step::Throw(null_reference()),
                    other => return Err(malformed_error!("stelem on {:?}", other)),
                }
            }

            (OpCode::Box, _) => {
                let value = pop(stack)?;
                stack.push(Value::Boxed(Box::new(value)));
                Step::Next
            }
            (OpCode::UnboxAny, _) => match pop(stack)? {
                Value::Boxed(inner) => {
                    stack.push(*inner);
                    Step::Next
                }
                Value::Null => Step::Throw(null_reference()),
                _ => Step::Throw(exception(INVALID_CAST, "Specified cast is not valid.")),
            },
            (OpCode::Castclass, Operand::Type(ty)) => {
                let value = pop(stack)?;
                let fits = match ty {
                    TypeSig::String => matches!(value, Value::Str(_) | Value::Null),
                    _ => true,
                };
                if fits {
                    stack.push(value);
                    Step::Next
                } else {
                    Step::Throw(exception(INVALID_CAST, "Specified cast is not valid."))
                }
            }
            (OpCode::Isinst, Operand::Type(ty)) => {
                let value = pop(stack)?;
                let fits = match ty {
                    TypeSig::String => matches!(value, Value::Str(_)),
                    _ => true,
                };
                stack.push(if fits { value } else { Value::Null });
                Step::Next
            }

            (OpCode::Ldsfld, Operand::Token(field)) => {
                let value = self.statics.get(field).cloned().unwrap_or(Value::Null);
                stack.push(value);
                Step::Next
            }
            (OpCode::Stsfld, Operand::Token(field)) => {
                let value = pop(stack)?;
                self.statics.insert(*field, value);
                Step::Next
            }

            (OpCode::Throw, _) => match pop(stack)? {
                Value::Null => Step::Throw(null_reference()),
                value => Step::Throw(value),
            },
            (OpCode::Rethrow, _) => Step::Throw(
                self.caught
                    .clone()
                    .ok_or_else(|| malformed_error!("rethrow outside of a catch"))?,
            ),
            (OpCode::Endfinally, _) => Step::EndFinally,
            (OpCode::Endfilter, _) => Step::EndFilter,

            _ => return Err(malformed_error!("cannot interpret {}", instr)),
        };
        Ok(step)
    }
}

fn pop(stack: &mut Vec<Value>) -> Result<Value> {
    stack
        .pop()
        .ok_or_else(|| malformed_error!("evaluation stack underflow"))
}

fn pop_i32(stack: &mut Vec<Value>) -> Result<i32> {
    match pop(stack)? {
        Value::I32(v) => Ok(v),
        other => Err(malformed_error!("expected int32, found {:?}", other)),
    }
}

fn text(value: &Value) -> Result<String> {
    match value {
        Value::Str(s) => Ok(s.clone()),
        Value::Null => Ok(String::new()),
        other => Err(malformed_error!("expected a string, found {:?}", other)),
    }
}

fn null_reference() -> Value {
    exception(NULL_REFERENCE, "Object reference not set to an instance of an object.")
}

fn index_out_of_range() -> Value {
    exception(INDEX_OUT_OF_RANGE, "Index was outside the bounds of the array.")
}

/// `None` for an integer division by zero.
fn binary(op: OpCode, a: &Value, b: &Value) -> Result<Option<Value>> {
    let value = match (a, b) {
        (Value::I32(x), Value::I32(y)) => {
            let (x, y) = (*x, *y);
            let (ux, uy) = (x as u32, y as u32);
            if matches!(op, OpCode::Div | OpCode::DivUn | OpCode::Rem | OpCode::RemUn) && y == 0 {
                return Ok(None);
            }
            Value::I32(match op {
                OpCode::Add => x.wrapping_add(y),
                OpCode::Sub => x.wrapping_sub(y),
                OpCode::Mul => x.wrapping_mul(y),
                OpCode::Div => x.wrapping_div(y),
                OpCode::DivUn => (ux / uy) as i32,
                OpCode::Rem => x.wrapping_rem(y),
                OpCode::RemUn => (ux % uy) as i32,
                OpCode::And => x & y,
                OpCode::Or => x | y,
                OpCode::Xor => x ^ y,
                OpCode::Shl => x.wrapping_shl(uy),
                OpCode::Shr => x.wrapping_shr(uy),
                _ => ux.wrapping_shr(uy) as i32,
            })
        }
        (Value::I64(x), Value::I64(y)) => {
            let (x, y) = (*x, *y);
            let (ux, uy) = (x as u64, y as u64);
            if matches!(op, OpCode::Div | OpCode::DivUn | OpCode::Rem | OpCode::RemUn) && y == 0 {
                return Ok(None);
            }
            Value::I64(match op {
                OpCode::Add => x.wrapping_add(y),
                OpCode::Sub => x.wrapping_sub(y),
                OpCode::Mul => x.wrapping_mul(y),
                OpCode::Div => x.wrapping_div(y),
                OpCode::DivUn => (ux / uy) as i64,
                OpCode::Rem => x.wrapping_rem(y),
                OpCode::RemUn => (ux % uy) as i64,
                OpCode::And => x & y,
                OpCode::Or => x | y,
                OpCode::Xor => x ^ y,
                _ => return Err(malformed_error!("{} on int64 operands", op)),
            })
        }
        (Value::I64(x), Value::I32(shift)) => {
            let shift = *shift as u32;
            Value::I64(match op {
                OpCode::Shl => x.wrapping_shl(shift),
                OpCode::Shr => x.wrapping_shr(shift),
                OpCode::ShrUn => (*x as u64).wrapping_shr(shift) as i64,
                _ => return Err(malformed_error!("{} on int64 and int32", op)),
            })
        }
        (Value::F64(x), Value::F64(y)) => Value::F64(match op {
            OpCode::Add => x + y,
            OpCode::Sub => x - y,
            OpCode::Mul => x * y,
            OpCode::Div => x / y,
            OpCode::Rem => x % y,
            _ => return Err(malformed_error!("{} on float operands", op)),
        }),
        _ => return Err(malformed_error!("{} on {:?} and {:?}", op, a, b)),
    };
    Ok(Some(value))
}

/// `None` when floats are unordered.
fn ordering(a: &Value, b: &Value, unsigned: bool) -> Result<Option<Ordering>> {
    Ok(match (a, b) {
        (Value::I32(x), Value::I32(y)) if unsigned => Some((*x as u32).cmp(&(*y as u32))),
        (Value::I32(x), Value::I32(y)) => Some(x.cmp(y)),
        (Value::I64(x), Value::I64(y)) if unsigned => Some((*x as u64).cmp(&(*y as u64))),
        (Value::I64(x), Value::I64(y)) => Some(x.cmp(y)),
        (Value::F64(x), Value::F64(y)) => x.partial_cmp(y),
        _ => return Err(malformed_error!("cannot compare {:?} and {:?}", a, b)),
    })
}

fn branch_taken(op: OpCode, a: &Value, b: &Value) -> Result<bool> {
    use Ordering::{Equal, Greater, Less};

    if matches!(op, OpCode::Beq | OpCode::BneUn) {
        let equal = match ordering(a, b, false) {
            Ok(order) => order == Some(Equal),
            Err(_) => a == b,
        };
        return Ok(equal == (op == OpCode::Beq));
    }

    let unsigned = matches!(
        op,
        OpCode::BgeUn | OpCode::BgtUn | OpCode::BleUn | OpCode::BltUn
    );
    let order = ordering(a, b, unsigned)?;
    Ok(match (op, order) {
        (_, None) => unsigned,
        (OpCode::Bge | OpCode::BgeUn, Some(o)) => matches!(o, Greater | Equal),
        (OpCode::Bgt | OpCode::BgtUn, Some(o)) => o == Greater,
        (OpCode::Ble | OpCode::BleUn, Some(o)) => matches!(o, Less | Equal),
        (_, Some(o)) => o == Less,
    })
}

fn convert(op: OpCode, value: &Value) -> Result<Value> {
    Ok(match (op, value) {
        (OpCode::ConvI4, Value::I32(v)) => Value::I32(*v),
        (OpCode::ConvI4, Value::I64(v)) => Value::I32(*v as i32),
        (OpCode::ConvI4, Value::F64(v)) => Value::I32(*v as i32),
        (OpCode::ConvU4, Value::I32(v)) => Value::I32(*v),
        (OpCode::ConvU4, Value::I64(v)) => Value::I32(*v as u32 as i32),
        (OpCode::ConvU4, Value::F64(v)) => Value::I32(*v as u32 as i32),
        (OpCode::ConvI8, Value::I32(v)) => Value::I64(i64::from(*v)),
        (OpCode::ConvI8, Value::I64(v)) => Value::I64(*v),
        (OpCode::ConvI8, Value::F64(v)) => Value::I64(*v as i64),
        (OpCode::ConvR8, Value::I32(v)) => Value::F64(f64::from(*v)),
        (OpCode::ConvR8, Value::I64(v)) => Value::F64(*v as f64),
        (OpCode::ConvR8, Value::F64(v)) => Value::F64(*v),
        _ => return Err(malformed_error!("{} on {:?}", op, value)),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cil::{BodyBuilder, MethodRef};

    #[test]
    fn test_arithmetic_and_branches() -> Result<()> {
        let body = BodyBuilder::new()
            .ldarg(0)
            .ldc_i4(3)
            .branch(OpCode::Bgt, "big")
            .ldc_i4(1)
            .ret()
            .label("big")
            .ldarg(0)
            .ldc_i4(2)
            .op(OpCode::Mul)
            .ret()
            .build()?;

        assert_eq!(
            run(&body, &[Value::I32(2)], &[])?,
            Outcome::Returned(Some(Value::I32(1)))
        );
        assert_eq!(
            run(&body, &[Value::I32(5)], &[])?,
            Outcome::Returned(Some(Value::I32(10)))
        );
        Ok(())
    }

    #[test]
    fn test_finally_runs_on_leave_and_throw() -> Result<()> {
        let body = BodyBuilder::new()
            .label("try")
            .ldc_i4(10)
            .ldarg(0)
            .op(OpCode::Div)
            .op(OpCode::Pop)
            .leave("end")
            .label("finally")
            .ldstr("finally")
            .call(MethodRef::static_method(TRACE, 1, false))
            .op(OpCode::Endfinally)
            .label("end")
            .ldc_i4(0)
            .ret()
            .finally_handler("try", "finally", "finally", "end")
            .build()?;

        let (ok, trace) = execute(&body, &[Value::I32(2)], &[])?;
        assert_eq!(ok, Outcome::Returned(Some(Value::I32(0))));
        assert_eq!(trace, vec![Value::Str("finally".into())]);

        let (thrown, trace) = execute(&body, &[Value::I32(0)], &[])?;
        assert!(matches!(
            thrown,
            Outcome::Threw(Value::Exception { kind: DIVIDE_BY_ZERO, .. })
        ));
        assert_eq!(trace.len(), 1);
        Ok(())
    }

    #[test]
    fn test_runaway_loop_is_reported() -> Result<()> {
        let body = BodyBuilder::new()
            .label("top")
            .branch(OpCode::Br, "top")
            .build()?;
        assert!(run(&body, &[], &[]).is_err());
        Ok(())
    }
}
