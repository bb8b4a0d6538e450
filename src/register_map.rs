use crate::error::TransportError;

// Register layout from the Kostal Plenticore Modbus TCP interface description.
// All values are holding registers, multi-word values are high word first.

/// How the words of a register are interpreted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegisterEncoding {
    Int16,
    Float32,
}

impl RegisterEncoding {
    pub const fn word_count(self) -> u16 {
        match self {
            RegisterEncoding::Int16 => 1,
            RegisterEncoding::Float32 => 2,
        }
    }

    /// Decodes the raw words returned for a register read at `address`.
    pub fn decode(self, address: u16, words: &[u16]) -> Result<f64, TransportError> {
        let expected = self.word_count() as usize;
        if words.len() != expected {
            return Err(TransportError::Malformed {
                address,
                expected,
                actual: words.len(),
            });
        }
        let value = match self {
            RegisterEncoding::Int16 => f64::from(words[0] as i16),
            RegisterEncoding::Float32 => f64::from(merge_u16_f32(words[0], words[1])),
        };
        Ok(value)
    }
}

/// Converts two u16 values into a f32 (big-endian word order)
fn merge_u16_f32(high: u16, low: u16) -> f32 {
    let combined: u32 = ((high as u32) << 16) | (low as u32);
    f32::from_bits(combined)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Register {
    pub address: u16,
    pub encoding: RegisterEncoding,
}

/// Physical quantities read from the inverter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Quantity {
    Power,
    Exported,
}

impl Quantity {
    pub const fn name(self) -> &'static str {
        match self {
            Quantity::Power => "power",
            Quantity::Exported => "exported",
        }
    }
}

/// Read order of a cycle: power first, then the energy counter.
pub static PLENTICORE_REGISTERS: [(Quantity, Register); 2] = [
    (
        Quantity::Power,
        Register {
            address: 575,
            encoding: RegisterEncoding::Int16,
        },
    ),
    (
        Quantity::Exported,
        Register {
            address: 320,
            encoding: RegisterEncoding::Float32,
        },
    ),
];

pub fn register_for(quantity: Quantity) -> Option<Register> {
    PLENTICORE_REGISTERS
        .iter()
        .find(|(mapped, _)| *mapped == quantity)
        .map(|(_, register)| *register)
}

/// A decoded value from one register, valid for a single cycle.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RegisterReading {
    pub quantity: Quantity,
    pub value: f64,
}

/// Looks up the value read for `quantity` in one cycle's readings.
pub fn reading_of(readings: &[RegisterReading], quantity: Quantity) -> Option<f64> {
    readings
        .iter()
        .find(|reading| reading.quantity == quantity)
        .map(|reading| reading.value)
}
