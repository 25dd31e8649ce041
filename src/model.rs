use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    Employee,
    TeamLead,
    DeptHead,
    CenterHead,
    Admin,
}

impl Role {
    pub const ALL: [Role; 5] = [
        Role::Employee,
        Role::TeamLead,
        Role::DeptHead,
        Role::CenterHead,
        Role::Admin,
    ];

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "employee" => Some(Self::Employee),
            "team_lead" => Some(Self::TeamLead),
            "dept_head" => Some(Self::DeptHead),
            "center_head" => Some(Self::CenterHead),
            "admin" => Some(Self::Admin),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Employee => "employee",
            Self::TeamLead => "team_lead",
            Self::DeptHead => "dept_head",
            Self::CenterHead => "center_head",
            Self::Admin => "admin",
        }
    }
}

/// Components of a final score that carry a per-role weight.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum EvaluationItem {
    #[serde(rename = "peer_review")]
    Peer,
    #[serde(rename = "pm_review")]
    Pm,
    #[serde(rename = "qualitative_review")]
    Qualitative,
}

impl EvaluationItem {
    pub const ALL: [EvaluationItem; 3] = [
        EvaluationItem::Peer,
        EvaluationItem::Pm,
        EvaluationItem::Qualitative,
    ];

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "peer_review" => Some(Self::Peer),
            "pm_review" => Some(Self::Pm),
            "qualitative_review" => Some(Self::Qualitative),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Peer => "peer_review",
            Self::Pm => "pm_review",
            Self::Qualitative => "qualitative_review",
        }
    }
}

/// Individual grade. Only S and A are quota-limited; B+ and B- must balance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Grade {
    S,
    A,
    #[serde(rename = "B+")]
    BPlus,
    B,
    #[serde(rename = "B-")]
    BMinus,
    C,
    D,
}

impl Grade {
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim() {
            "S" => Some(Self::S),
            "A" => Some(Self::A),
            "B+" => Some(Self::BPlus),
            "B" => Some(Self::B),
            "B-" => Some(Self::BMinus),
            "C" => Some(Self::C),
            "D" => Some(Self::D),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::S => "S",
            Self::A => "A",
            Self::BPlus => "B+",
            Self::B => "B",
            Self::BMinus => "B-",
            Self::C => "C",
            Self::D => "D",
        }
    }
}

/// Coarse rating of a whole department for a period.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum DepartmentGrade {
    S,
    A,
    B,
}

impl DepartmentGrade {
    pub const ALL: [DepartmentGrade; 3] = [DepartmentGrade::S, DepartmentGrade::A, DepartmentGrade::B];

    pub fn parse(s: &str) -> Option<Self> {
        match s.trim() {
            "S" => Some(Self::S),
            "A" => Some(Self::A),
            "B" => Some(Self::B),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::S => "S",
            Self::A => "A",
            Self::B => "B",
        }
    }
}
