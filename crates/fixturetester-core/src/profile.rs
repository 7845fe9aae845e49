//! Fixture device profiles
//!
//! A [`DeviceProfile`] captures everything that varies between fixture
//! variants as plain data: GPIO channel count, pin adjacency, sensor
//! channels, handshake signatures, and which opcodes require device
//! acknowledgment. The workflow engine is written once against this data
//! instead of being forked per variant.

use serde::Serialize;

use crate::protocol::frame::opcode;

/// The two independent sensing/control links of a fixture.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum DeviceRole {
    /// Line-oriented text protocol link (drain-side voltage sensing)
    Arduino,
    /// Binary checksum-framed protocol link (source-side sensing, GPIO control)
    Stm32,
}

impl std::fmt::Display for DeviceRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DeviceRole::Arduino => write!(f, "Arduino"),
            DeviceRole::Stm32 => write!(f, "STM32"),
        }
    }
}

/// Electrical condition of a channel: output de-asserted or asserted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum ReadingState {
    /// Output de-asserted
    Idle,
    /// Output asserted
    Running,
}

impl std::fmt::Display for ReadingState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ReadingState::Idle => write!(f, "idle"),
            ReadingState::Running => write!(f, "running"),
        }
    }
}

/// One physically adjacent neighbor of a channel.
///
/// Derived from the fixture's connector pinout; fixed per profile and never
/// mutated during a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum Neighbor {
    /// Another GPIO channel
    Gpio(u8),
    /// The supply rail pin
    SupplyRail,
    /// The ground rail pin
    GroundRail,
    /// No neighbor on this side
    None,
}

/// Non-GPIO sensor kinds, each with its own settle behavior.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum SensorKind {
    Pressure,
    Temperature,
    /// Read three times with flow enabled, once after disable
    Flow,
}

/// One sensor channel on the text-protocol device.
#[derive(Debug, Clone)]
pub struct SensorSpec {
    /// Name reported by the device in its response lines
    pub name: &'static str,
    /// Pin/channel id the sensor answers on
    pub channel: u8,
    pub kind: SensorKind,
}

/// Structural description of one fixture variant.
#[derive(Debug, Clone)]
pub struct DeviceProfile {
    /// Human-readable variant name
    pub name: &'static str,
    /// Number of GPIO channels (ids `0..gpio_channels`)
    pub gpio_channels: u8,
    /// Serial baud rate for both links
    pub baud_rate: u32,
    /// Substring the text device's identify response must contain
    pub text_signature: &'static str,
    /// Identify command sent on the text link during connect
    pub text_ident_command: &'static str,
    /// Read-command token on the text link (`"<token> <pin>"`)
    pub text_read_token: &'static str,
    /// Pin adjacency: index = channel id, up to two neighbors each
    pub adjacency: Vec<[Neighbor; 2]>,
    /// Non-GPIO sensor channels swept at the end of a run
    pub sensors: Vec<SensorSpec>,
    /// Opcodes whose effect must be acknowledged before proceeding
    pub confirmable_opcodes: Vec<u8>,
}

impl DeviceProfile {
    /// Whether `channel` is a valid GPIO channel id for this profile.
    pub fn is_gpio_channel(&self, channel: u8) -> bool {
        channel < self.gpio_channels
    }

    /// All GPIO channel ids in order.
    pub fn gpio_range(&self) -> impl Iterator<Item = u8> {
        0..self.gpio_channels
    }

    /// Whether commands with this opcode must be confirmed by the device.
    pub fn is_confirmable(&self, op: u8) -> bool {
        self.confirmable_opcodes.contains(&op)
    }

    /// Neighbors of `channel`, or both-`None` for out-of-range ids.
    pub fn neighbors_of(&self, channel: u8) -> [Neighbor; 2] {
        self.adjacency
            .get(channel as usize)
            .copied()
            .unwrap_or([Neighbor::None, Neighbor::None])
    }
}

/// Linear pinout adjacency: first pin borders the supply rail, last pin
/// borders the ground rail, interior pins border their numeric neighbors.
fn linear_adjacency(channels: u8) -> Vec<[Neighbor; 2]> {
    (0..channels)
        .map(|ch| {
            let left = if ch == 0 {
                Neighbor::SupplyRail
            } else {
                Neighbor::Gpio(ch - 1)
            };
            let right = if ch + 1 == channels {
                Neighbor::GroundRail
            } else {
                Neighbor::Gpio(ch + 1)
            };
            [left, right]
        })
        .collect()
}

/// The full 18-channel fixture.
pub fn full_fixture() -> DeviceProfile {
    DeviceProfile {
        name: "full-18ch",
        gpio_channels: 18,
        baud_rate: 115_200,
        text_signature: "FIXT-A",
        text_ident_command: "ident",
        text_read_token: "get",
        adjacency: linear_adjacency(18),
        sensors: vec![
            SensorSpec {
                name: "pressure",
                channel: 18,
                kind: SensorKind::Pressure,
            },
            SensorSpec {
                name: "temperature",
                channel: 19,
                kind: SensorKind::Temperature,
            },
            SensorSpec {
                name: "flow",
                channel: 20,
                kind: SensorKind::Flow,
            },
        ],
        confirmable_opcodes: vec![opcode::GPIO_ON, opcode::GPIO_OFF],
    }
}

/// The compact 12-channel variant: same protocols, fewer channels, no flow
/// sensor fitted.
pub fn compact_fixture() -> DeviceProfile {
    DeviceProfile {
        name: "compact-12ch",
        gpio_channels: 12,
        baud_rate: 115_200,
        text_signature: "FIXT-A",
        text_ident_command: "ident",
        text_read_token: "get",
        adjacency: linear_adjacency(12),
        sensors: vec![
            SensorSpec {
                name: "pressure",
                channel: 12,
                kind: SensorKind::Pressure,
            },
            SensorSpec {
                name: "temperature",
                channel: 13,
                kind: SensorKind::Temperature,
            },
        ],
        confirmable_opcodes: vec![opcode::GPIO_ON, opcode::GPIO_OFF],
    }
}

/// Look up a built-in profile by name.
pub fn by_name(name: &str) -> Option<DeviceProfile> {
    match name {
        "full-18ch" => Some(full_fixture()),
        "compact-12ch" => Some(compact_fixture()),
        _ => None,
    }
}
