/// Request priority, `Highest` first. Write scheduling and pending-request
/// promotion are strict over this order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum RequestPriority {
    Highest = 0,
    Medium = 1,
    Low = 2,
    Lowest = 3,
    Idle = 4,
}

pub const NUM_PRIORITIES: usize = 5;

impl RequestPriority {
    pub const ALL: [RequestPriority; NUM_PRIORITIES] = [
        RequestPriority::Highest,
        RequestPriority::Medium,
        RequestPriority::Low,
        RequestPriority::Lowest,
        RequestPriority::Idle,
    ];

    pub fn index(self) -> usize {
        self as usize
    }

    /// HTTP/2 weight advertised for this priority.
    pub fn weight(self) -> u16 {
        match self {
            RequestPriority::Highest => 256,
            RequestPriority::Medium => 220,
            RequestPriority::Low => 183,
            RequestPriority::Lowest => 147,
            RequestPriority::Idle => 110,
        }
    }

    /// Inverse of [`weight`](Self::weight): the priority whose weight is the
    /// closest one not above `weight`.
    pub fn from_weight(weight: u16) -> Self {
        Self::ALL
            .iter()
            .copied()
            .find(|p| weight >= p.weight())
            .unwrap_or(RequestPriority::Idle)
    }
}

impl Default for RequestPriority {
    fn default() -> Self {
        RequestPriority::Lowest
    }
}

impl std::fmt::Display for RequestPriority {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            RequestPriority::Highest => "highest",
            RequestPriority::Medium => "medium",
            RequestPriority::Low => "low",
            RequestPriority::Lowest => "lowest",
            RequestPriority::Idle => "idle",
        };
        f.write_str(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn weight_roundtrips_through_priority() {
        for priority in RequestPriority::ALL {
            assert_eq!(RequestPriority::from_weight(priority.weight()), priority);
        }
        assert_eq!(RequestPriority::from_weight(1), RequestPriority::Idle);
        assert_eq!(RequestPriority::from_weight(200), RequestPriority::Low);
    }

    #[test]
    fn ordering_is_highest_first() {
        assert!(RequestPriority::Highest < RequestPriority::Idle);
        assert_eq!(RequestPriority::Low.index(), 2);
    }
}
