//! Three-address code: the IR that sits between the typed AST and x86-64.
//!
//! `Operand`'s `Serialize`/`Deserialize` impls render the four operand kinds
//! the way spec.md §6 describes the JSON interchange format: temporaries and
//! labels as tagged strings, immediates as bare integers — the same
//! flattened-row shape `other_examples`'s Bril IR types use for instructions.

use std::fmt;

use serde::de::{self, Visitor};
use serde::{Deserialize, Deserializer, Serialize, Serializer};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Opcode {
    Const,
    Copy,
    Add,
    Sub,
    Mul,
    Div,
    Mod,
    And,
    Or,
    Xor,
    Shl,
    Shr,
    Neg,
    Not,
    Label,
    Jmp,
    Je,
    Jne,
    Jl,
    Jle,
    Jg,
    Jge,
    Jz,
    Param,
    Call,
    Ret,
    Print,
    Phi,
    Nop,
}

impl Opcode {
    /// `je, jne, jl, jle, jg, jge, jz` — opcodes that terminate a block with
    /// two successors (fallthrough + target).
    pub fn is_conditional_jump(self) -> bool {
        matches!(self, Opcode::Je | Opcode::Jne | Opcode::Jl | Opcode::Jle | Opcode::Jg | Opcode::Jge | Opcode::Jz)
    }

    /// Block-terminating opcodes in the strict §4.F sense: only `jmp`/`ret`
    /// end a basic block. Conditional jumps sit mid-block — the lowering
    /// always follows one with an unconditional `jmp` for the fallthrough
    /// case, so they never dangle at a block's tail.
    pub fn is_terminator(self) -> bool {
        self == Opcode::Jmp || self == Opcode::Ret
    }
}

impl fmt::Display for Opcode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Opcode::Const => "const",
            Opcode::Copy => "copy",
            Opcode::Add => "add",
            Opcode::Sub => "sub",
            Opcode::Mul => "mul",
            Opcode::Div => "div",
            Opcode::Mod => "mod",
            Opcode::And => "and",
            Opcode::Or => "or",
            Opcode::Xor => "xor",
            Opcode::Shl => "shl",
            Opcode::Shr => "shr",
            Opcode::Neg => "neg",
            Opcode::Not => "not",
            Opcode::Label => "label",
            Opcode::Jmp => "jmp",
            Opcode::Je => "je",
            Opcode::Jne => "jne",
            Opcode::Jl => "jl",
            Opcode::Jle => "jle",
            Opcode::Jg => "jg",
            Opcode::Jge => "jge",
            Opcode::Jz => "jz",
            Opcode::Param => "param",
            Opcode::Call => "call",
            Opcode::Ret => "ret",
            Opcode::Print => "print",
            Opcode::Phi => "phi",
            Opcode::Nop => "nop",
        };
        f.write_str(s)
    }
}

/// An operand: a virtual register, a label, or an immediate integer.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Operand {
    /// `%N` — a numbered local temporary.
    Temp(u32),
    /// `%name` — a named parameter temporary.
    Param(String),
    /// `@name` — a global variable or procedure.
    Global(String),
    /// `%.Ln` — a label.
    Label(u32),
    /// A bare integer immediate (`const` source, `param` position index).
    Imm(i64),
}

impl fmt::Display for Operand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Operand::Temp(n) => write!(f, "%{n}"),
            Operand::Param(name) => write!(f, "%{name}"),
            Operand::Global(name) => write!(f, "@{name}"),
            Operand::Label(n) => write!(f, "%.L{n}"),
            Operand::Imm(n) => write!(f, "{n}"),
        }
    }
}

impl Serialize for Operand {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            Operand::Imm(n) => serializer.serialize_i64(*n),
            other => serializer.serialize_str(&other.to_string()),
        }
    }
}

struct OperandVisitor;

impl<'de> Visitor<'de> for OperandVisitor {
    type Value = Operand;

    fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("an operand string (\"%N\", \"%name\", \"@name\", \"%.Ln\") or an integer")
    }

    fn visit_i64<E: de::Error>(self, v: i64) -> Result<Operand, E> {
        Ok(Operand::Imm(v))
    }

    fn visit_u64<E: de::Error>(self, v: u64) -> Result<Operand, E> {
        Ok(Operand::Imm(v as i64))
    }

    fn visit_str<E: de::Error>(self, v: &str) -> Result<Operand, E> {
        parse_operand(v).ok_or_else(|| E::custom(format!("malformed operand '{v}'")))
    }
}

fn parse_operand(s: &str) -> Option<Operand> {
    if let Some(rest) = s.strip_prefix("%.L") {
        return rest.parse().ok().map(Operand::Label);
    }
    if let Some(rest) = s.strip_prefix('%') {
        return Some(match rest.parse::<u32>() {
            Ok(n) => Operand::Temp(n),
            Err(_) => Operand::Param(rest.to_string()),
        });
    }
    if let Some(rest) = s.strip_prefix('@') {
        return Some(Operand::Global(rest.to_string()));
    }
    None
}

impl<'de> Deserialize<'de> for Operand {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        deserializer.deserialize_any(OperandVisitor)
    }
}

/// A single TAC instruction: `(opcode, args[], dest?)`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Instr {
    pub opcode: Opcode,
    pub args: Vec<Operand>,
    pub result: Option<Operand>,
}

// `Opcode` needs its own (de)serialization as the lowercase opcode name.
impl Serialize for Opcode {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for Opcode {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Opcode::from_str(&s).ok_or_else(|| de::Error::custom(format!("unknown opcode '{s}'")))
    }
}

impl Opcode {
    fn from_str(s: &str) -> Option<Opcode> {
        Some(match s {
            "const" => Opcode::Const,
            "copy" => Opcode::Copy,
            "add" => Opcode::Add,
            "sub" => Opcode::Sub,
            "mul" => Opcode::Mul,
            "div" => Opcode::Div,
            "mod" => Opcode::Mod,
            "and" => Opcode::And,
            "or" => Opcode::Or,
            "xor" => Opcode::Xor,
            "shl" => Opcode::Shl,
            "shr" => Opcode::Shr,
            "neg" => Opcode::Neg,
            "not" => Opcode::Not,
            "label" => Opcode::Label,
            "jmp" => Opcode::Jmp,
            "je" => Opcode::Je,
            "jne" => Opcode::Jne,
            "jl" => Opcode::Jl,
            "jle" => Opcode::Jle,
            "jg" => Opcode::Jg,
            "jge" => Opcode::Jge,
            "jz" => Opcode::Jz,
            "param" => Opcode::Param,
            "call" => Opcode::Call,
            "ret" => Opcode::Ret,
            "print" => Opcode::Print,
            "phi" => Opcode::Phi,
            "nop" => Opcode::Nop,
            _ => return None,
        })
    }
}

impl Instr {
    pub fn new(opcode: Opcode, args: Vec<Operand>, result: Option<Operand>) -> Self {
        Instr { opcode, args, result }
    }

    pub fn label(l: u32) -> Self {
        Instr::new(Opcode::Label, vec![Operand::Label(l)], None)
    }

    pub fn jmp(l: u32) -> Self {
        Instr::new(Opcode::Jmp, vec![Operand::Label(l)], None)
    }

    /// The label this instruction jumps to, if it is any kind of jump
    /// (unconditional `jmp` or a conditional `je/jne/jl/jle/jg/jge/jz`).
    pub fn jump_target(&self) -> Option<u32> {
        if self.opcode != Opcode::Jmp && !self.opcode.is_conditional_jump() {
            return None;
        }
        match self.args.last() {
            Some(Operand::Label(l)) => Some(*l),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum TacDecl {
    GlobalVar {
        #[serde(rename = "var")]
        name: String,
        init: i64,
    },
    Proc {
        #[serde(rename = "proc")]
        name: String,
        #[serde(rename = "args")]
        params: Vec<String>,
        body: Vec<Instr>,
    },
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TacProgram {
    pub decls: Vec<TacDecl>,
}

impl TacProgram {
    pub fn procs(&self) -> impl Iterator<Item = (&str, &[String], &[Instr])> {
        self.decls.iter().filter_map(|d| match d {
            TacDecl::Proc { name, params, body } => Some((name.as_str(), params.as_slice(), body.as_slice())),
            TacDecl::GlobalVar { .. } => None,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn operand_display_matches_spec_notation() {
        assert_eq!(Operand::Temp(3).to_string(), "%3");
        assert_eq!(Operand::Param("n".into()).to_string(), "%n");
        assert_eq!(Operand::Global("main".into()).to_string(), "@main");
        assert_eq!(Operand::Label(2).to_string(), "%.L2");
        assert_eq!(Operand::Imm(-5).to_string(), "-5");
    }

    #[test]
    fn operand_json_round_trips() {
        for op in [Operand::Temp(1), Operand::Param("x".into()), Operand::Global("f".into()), Operand::Label(0), Operand::Imm(42)] {
            let json = serde_json::to_string(&op).unwrap();
            let back: Operand = serde_json::from_str(&json).unwrap();
            assert_eq!(op, back);
        }
    }

    #[test]
    fn imm_serializes_as_bare_integer() {
        assert_eq!(serde_json::to_string(&Operand::Imm(14)).unwrap(), "14");
    }

    #[test]
    fn program_serializes_to_spec_shape() {
        let prog = TacProgram {
            decls: vec![
                TacDecl::GlobalVar { name: "@g".into(), init: 1 },
                TacDecl::Proc {
                    name: "@main".into(),
                    params: vec![],
                    body: vec![Instr::new(Opcode::Const, vec![Operand::Imm(1)], Some(Operand::Temp(0)))],
                },
            ],
        };
        let json = serde_json::to_value(&prog).unwrap();
        let decls = json["decls"].as_array().unwrap();
        assert_eq!(decls[0]["var"], "@g");
        assert_eq!(decls[0]["init"], 1);
        assert_eq!(decls[1]["proc"], "@main");
        assert_eq!(decls[1]["body"][0]["opcode"], "const");
    }

    #[test]
    fn jump_target_reads_trailing_label() {
        assert_eq!(Instr::jmp(7).jump_target(), Some(7));
        let ret = Instr::new(Opcode::Ret, vec![], None);
        assert_eq!(ret.jump_target(), None);
    }
}
