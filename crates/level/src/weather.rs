/// Particle weather selected by in-level weather zones.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum WeatherKind {
    #[default]
    None,
    Snow,
    Flowers,
    Rain,
    Leaf,
}

const OUTDOORS_ONLY_BIT: u8 = 0x80;

/// Weather state as carried in event parameters: a kind in the low bits and
/// an "outdoors only" modifier in the high bit.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Weather {
    pub kind: WeatherKind,
    /// Particles are suppressed while the camera is inside.
    pub outdoors_only: bool,
}

impl Weather {
    pub fn from_raw(raw: u8) -> Weather {
        let kind = match raw & !OUTDOORS_ONLY_BIT {
            1 => WeatherKind::Snow,
            2 => WeatherKind::Flowers,
            3 => WeatherKind::Rain,
            4 => WeatherKind::Leaf,
            _ => WeatherKind::None,
        };
        Weather {
            kind,
            outdoors_only: raw & OUTDOORS_ONLY_BIT != 0,
        }
    }

    pub fn to_raw(self) -> u8 {
        let kind = match self.kind {
            WeatherKind::None => 0,
            WeatherKind::Snow => 1,
            WeatherKind::Flowers => 2,
            WeatherKind::Rain => 3,
            WeatherKind::Leaf => 4,
        };
        kind | if self.outdoors_only { OUTDOORS_ONLY_BIT } else { 0 }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn raw_roundtrip_keeps_kind_and_modifier() {
        for raw in [0u8, 1, 2, 3, 4, 0x81, 0x84] {
            let weather = Weather::from_raw(raw);
            assert_eq!(weather.to_raw(), raw);
        }
    }

    #[test]
    fn unknown_kinds_decay_to_none() {
        assert_eq!(Weather::from_raw(9).kind, WeatherKind::None);
        let outdoors = Weather::from_raw(0x80 | 9);
        assert_eq!(outdoors.kind, WeatherKind::None);
        assert!(outdoors.outdoors_only);
    }
}
