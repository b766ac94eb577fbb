//! Hand-rolled image builder for interpreter tests, mirroring the
//! format the loader consumes.

use lyra_runtime::{Opcode, IMAGE_MAGIC, IMAGE_VERSION};

#[allow(dead_code)]
pub enum ConstVal {
    Nil,
    False,
    True,
    Num(f64),
    Str(String),
}

pub struct ProtoBuilder {
    insts: Vec<(Opcode, u8, i16)>,
    consts: Vec<ConstVal>,
    ups: Vec<(u16, u16)>,
    protos: Vec<ProtoBuilder>,
    name: String,
}

impl ProtoBuilder {
    pub fn new(name: &str) -> Self {
        Self {
            insts: Vec::new(),
            consts: Vec::new(),
            ups: Vec::new(),
            protos: Vec::new(),
            name: name.to_string(),
        }
    }

    pub fn inst(&mut self, op: Opcode, a: u8, b: i16) -> &mut Self {
        self.insts.push((op, a, b));
        self
    }

    pub fn constant(&mut self, c: ConstVal) -> u8 {
        self.consts.push(c);
        (self.consts.len() - 1) as u8
    }

    pub fn upvalue(&mut self, level: u16, slot: u16) -> u8 {
        self.ups.push((level, slot));
        (self.ups.len() - 1) as u8
    }

    pub fn proto(&mut self, p: ProtoBuilder) -> u8 {
        self.protos.push(p);
        (self.protos.len() - 1) as u8
    }

    fn emit(&self, buf: &mut Vec<u8>) {
        buf.extend_from_slice(&(self.insts.len() as u32).to_le_bytes());
        for (op, a, b) in &self.insts {
            buf.push(*op as u8);
            buf.push(*a);
            buf.extend_from_slice(&b.to_le_bytes());
        }

        buf.extend_from_slice(&(self.consts.len() as u32).to_le_bytes());
        for c in &self.consts {
            match c {
                ConstVal::Nil => buf.push(0),
                ConstVal::False => buf.push(1),
                ConstVal::True => buf.push(2),
                ConstVal::Num(n) => {
                    buf.push(3);
                    buf.extend_from_slice(&n.to_le_bytes());
                }
                ConstVal::Str(s) => {
                    buf.push(4);
                    buf.extend_from_slice(&(s.len() as u32).to_le_bytes());
                    buf.extend_from_slice(s.as_bytes());
                }
            }
        }

        buf.extend_from_slice(&(self.ups.len() as u32).to_le_bytes());
        for (level, slot) in &self.ups {
            buf.extend_from_slice(&level.to_le_bytes());
            buf.extend_from_slice(&slot.to_le_bytes());
        }

        buf.extend_from_slice(&(self.protos.len() as u32).to_le_bytes());
        for p in &self.protos {
            p.emit(buf);
        }

        buf.extend_from_slice(&(self.name.len() as u32).to_le_bytes());
        buf.extend_from_slice(self.name.as_bytes());

        // One line-info entry per instruction.
        buf.extend_from_slice(&(self.insts.len() as u32).to_le_bytes());
        for (i, _) in self.insts.iter().enumerate() {
            buf.extend_from_slice(&(i as u32 + 1).to_le_bytes());
        }
    }

    pub fn image(&self) -> Vec<u8> {
        let mut buf = Vec::new();
        buf.extend_from_slice(&IMAGE_MAGIC);
        buf.push(IMAGE_VERSION.0);
        buf.push(IMAGE_VERSION.1);
        buf.extend_from_slice(&0u16.to_le_bytes());
        self.emit(&mut buf);
        buf
    }
}
