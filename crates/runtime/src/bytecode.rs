//! Bytecode image format: opcodes, instructions and the loader.
//!
//! An image is a little-endian byte stream: a four byte magic
//! (`0x1b 's' 'u' 'c'`), one byte each of major and minor version, a
//! 16-bit flags word that must be zero, then one recursively encoded
//! prototype. Every opcode byte and constant tag is validated while
//! reading, so a malformed image is rejected before it can reach the
//! interpreter.
//!
//! ```text
//! Prototype:
//!   u32 num_inst      Instruction[num_inst]      {u8 op, u8 a, i16 b}
//!   u32 num_const     Const[num_const]           u8 tag + payload
//!   u32 num_ups       Upvalue[num_ups]           {u16 outer_level, u16 slot}
//!   u32 num_prot      Prototype[num_prot]
//!   u32 name_size     bytes[name_size]
//!   u32 num_lineinf   u32[num_lineinf]
//! ```

use std::io::Read;

use num_enum::TryFromPrimitive;
use thiserror::Error;

pub const IMAGE_MAGIC: [u8; 4] = [0x1b, b's', b'u', b'c'];
pub const IMAGE_VERSION: (u8, u8) = (0, 1);

/// Failure while reading a bytecode image. Loading never touches the
/// value stack, so the state is unchanged after any of these.
#[derive(Debug, Error)]
pub enum ImageError {
    #[error("bad magic; not a compiled image")]
    BadMagic,
    #[error("image version {0}.{1} does not match runtime {major}.{minor}",
        major = IMAGE_VERSION.0, minor = IMAGE_VERSION.1)]
    BadVersion(u8, u8),
    #[error("reserved image flags must be zero, got {0:#06x}")]
    BadFlags(u16),
    #[error("unknown opcode {0:#04x}")]
    BadOpcode(u8),
    #[error("unknown constant tag {0:#04x}")]
    BadConstTag(u8),
    #[error("truncated image: {0}")]
    Io(#[from] std::io::Error),
}

/// The instruction set. `a` is an unsigned byte operand, `b` a signed
/// 16-bit operand; which one an opcode consumes is up to the opcode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, TryFromPrimitive)]
#[repr(u8)]
pub enum Opcode {
    Push,
    Pop,
    Load,
    Lup,
    Lcl,

    Add,
    Sub,
    Mul,
    Div,
    Mod,
    Pow,
    Unm,

    Eq,
    Less,
    LessEqual,

    Not,
    And,
    Or,

    Test,
    For,
    Jmp,

    Return,
    Shift,
    Call,
    TailCall,
    Lambda,

    GetGlobal,
    SetGlobal,
}

#[derive(Debug, Clone, Copy)]
pub struct Instruction {
    pub op: Opcode,
    pub a: u8,
    pub b: i16,
}

/// Constant-pool entry tags.
#[derive(Debug, Clone, Copy, PartialEq, Eq, TryFromPrimitive)]
#[repr(u8)]
enum ConstTag {
    Nil,
    False,
    True,
    Number,
    Str,
}

/// A constant as stored in a prototype; materialised into a [`Value`]
/// when a closure is created.
#[derive(Debug, Clone)]
pub enum Const {
    Nil,
    False,
    True,
    Number(f64),
    Str(Box<[u8]>),
}

/// Upvalue descriptor: how many frames out, and which slot.
#[derive(Debug, Clone, Copy)]
pub struct Upvalue {
    pub level: u16,
    pub slot: u16,
}

/// Parsed prototype tree, not yet on the heap.
#[derive(Debug)]
pub(crate) struct ProtoData {
    pub insts: Vec<Instruction>,
    pub constants: Vec<Const>,
    pub upvalues: Vec<Upvalue>,
    pub protos: Vec<ProtoData>,
    pub name: String,
    pub lineinfo: Vec<u32>,
}

struct Reader<R> {
    inner: R,
}

impl<R: Read> Reader<R> {
    fn u8(&mut self) -> Result<u8, ImageError> {
        let mut b = [0u8; 1];
        self.inner.read_exact(&mut b)?;
        Ok(b[0])
    }

    fn u16(&mut self) -> Result<u16, ImageError> {
        let mut b = [0u8; 2];
        self.inner.read_exact(&mut b)?;
        Ok(u16::from_le_bytes(b))
    }

    fn i16(&mut self) -> Result<i16, ImageError> {
        let mut b = [0u8; 2];
        self.inner.read_exact(&mut b)?;
        Ok(i16::from_le_bytes(b))
    }

    fn u32(&mut self) -> Result<u32, ImageError> {
        let mut b = [0u8; 4];
        self.inner.read_exact(&mut b)?;
        Ok(u32::from_le_bytes(b))
    }

    fn f64(&mut self) -> Result<f64, ImageError> {
        let mut b = [0u8; 8];
        self.inner.read_exact(&mut b)?;
        Ok(f64::from_le_bytes(b))
    }

    fn bytes(&mut self, n: usize) -> Result<Vec<u8>, ImageError> {
        let mut buf = vec![0u8; n];
        self.inner.read_exact(&mut buf)?;
        Ok(buf)
    }

    fn sized_bytes(&mut self) -> Result<Vec<u8>, ImageError> {
        let n = self.u32()? as usize;
        self.bytes(n)
    }

    fn verify_header(&mut self) -> Result<(), ImageError> {
        let mut magic = [0u8; 4];
        self.inner.read_exact(&mut magic)?;
        if magic != IMAGE_MAGIC {
            return Err(ImageError::BadMagic);
        }
        let major = self.u8()?;
        let minor = self.u8()?;
        if (major, minor) != IMAGE_VERSION {
            return Err(ImageError::BadVersion(major, minor));
        }
        let flags = self.u16()?;
        if flags != 0 {
            return Err(ImageError::BadFlags(flags));
        }
        Ok(())
    }

    fn prototype(&mut self) -> Result<ProtoData, ImageError> {
        let num_inst = self.u32()? as usize;
        let mut insts = Vec::with_capacity(num_inst.min(1 << 16));
        for _ in 0..num_inst {
            let op_byte = self.u8()?;
            let op =
                Opcode::try_from_primitive(op_byte).map_err(|_| ImageError::BadOpcode(op_byte))?;
            let a = self.u8()?;
            let b = self.i16()?;
            insts.push(Instruction { op, a, b });
        }

        let num_const = self.u32()? as usize;
        let mut constants = Vec::with_capacity(num_const.min(1 << 16));
        for _ in 0..num_const {
            let tag_byte = self.u8()?;
            let tag = ConstTag::try_from_primitive(tag_byte)
                .map_err(|_| ImageError::BadConstTag(tag_byte))?;
            constants.push(match tag {
                ConstTag::Nil => Const::Nil,
                ConstTag::False => Const::False,
                ConstTag::True => Const::True,
                ConstTag::Number => Const::Number(self.f64()?),
                ConstTag::Str => Const::Str(self.sized_bytes()?.into_boxed_slice()),
            });
        }

        let num_ups = self.u32()? as usize;
        let mut upvalues = Vec::with_capacity(num_ups.min(1 << 16));
        for _ in 0..num_ups {
            let level = self.u16()?;
            let slot = self.u16()?;
            upvalues.push(Upvalue { level, slot });
        }

        let num_prot = self.u32()? as usize;
        let mut protos = Vec::with_capacity(num_prot.min(1 << 10));
        for _ in 0..num_prot {
            protos.push(self.prototype()?);
        }

        let name = String::from_utf8_lossy(&self.sized_bytes()?).into_owned();

        let num_lineinf = self.u32()? as usize;
        let mut lineinfo = Vec::with_capacity(num_lineinf.min(1 << 16));
        for _ in 0..num_lineinf {
            lineinfo.push(self.u32()?);
        }

        Ok(ProtoData {
            insts,
            constants,
            upvalues,
            protos,
            name,
            lineinfo,
        })
    }
}

/// Read and validate a full image, returning the top-level prototype.
pub(crate) fn read_image(r: impl Read) -> Result<ProtoData, ImageError> {
    let mut reader = Reader { inner: r };
    reader.verify_header()?;
    reader.prototype()
}
