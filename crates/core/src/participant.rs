use std::{collections::BTreeMap, fmt::Display, str::FromStr};

use serde::{Deserialize, Serialize};

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum RosterError {
    #[error("the roster has no participants")]
    Empty,
    #[error("participant names cannot be empty")]
    EmptyName,
    #[error("participant `{0}` is listed more than once")]
    Duplicate(String),
    #[error("unknown participant role `{0}`")]
    UnknownRole(String),
}

/// What a client process does during the load period of every round.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, clap::ValueEnum,
)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// Sends messages spaced by the pacing delay handed out by the master.
    Publisher,
    /// Passively counts deliveries and reports them back at the end of the period.
    Subscriber,
}

impl Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Role::Publisher => write!(f, "publisher"),
            Role::Subscriber => write!(f, "subscriber"),
        }
    }
}

impl FromStr for Role {
    type Err = RosterError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "publisher" | "pub" => Ok(Role::Publisher),
            "subscriber" | "sub" => Ok(Role::Subscriber),
            other => Err(RosterError::UnknownRole(other.to_owned())),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Participant {
    pub name: String,
    pub role: Role,
}

impl Participant {
    pub fn new(name: impl Into<String>, role: Role) -> Self {
        Self {
            name: name.into(),
            role,
        }
    }

    pub fn publisher(name: impl Into<String>) -> Self {
        Self::new(name, Role::Publisher)
    }

    pub fn subscriber(name: impl Into<String>) -> Self {
        Self::new(name, Role::Subscriber)
    }
}

/// The fixed set of clients taking part in an experiment.
///
/// Publisher and subscriber counts are computed once here and never change for
/// the lifetime of the experiment.
#[derive(Debug, Clone)]
pub struct Roster {
    participants: BTreeMap<String, Role>,
    num_publishers: usize,
    num_subscribers: usize,
}

impl Roster {
    pub fn new(participants: impl IntoIterator<Item = Participant>) -> Result<Self, RosterError> {
        let mut by_name = BTreeMap::new();
        for Participant { name, role } in participants {
            if name.is_empty() {
                return Err(RosterError::EmptyName);
            }
            if by_name.insert(name.clone(), role).is_some() {
                return Err(RosterError::Duplicate(name));
            }
        }
        if by_name.is_empty() {
            return Err(RosterError::Empty);
        }
        let num_publishers = by_name
            .values()
            .filter(|role| **role == Role::Publisher)
            .count();
        let num_subscribers = by_name.len() - num_publishers;
        Ok(Self {
            participants: by_name,
            num_publishers,
            num_subscribers,
        })
    }

    /// Number of connections the master expects every round.
    pub fn len(&self) -> usize {
        self.participants.len()
    }

    pub fn is_empty(&self) -> bool {
        self.participants.is_empty()
    }

    pub fn num_publishers(&self) -> usize {
        self.num_publishers
    }

    pub fn num_subscribers(&self) -> usize {
        self.num_subscribers
    }

    pub fn contains(&self, name: &str) -> bool {
        self.participants.contains_key(name)
    }

    pub fn role_of(&self, name: &str) -> Option<Role> {
        self.participants.get(name).copied()
    }

    pub fn iter(&self) -> impl Iterator<Item = Participant> + '_ {
        self.participants
            .iter()
            .map(|(name, role)| Participant::new(name.clone(), *role))
    }
}
