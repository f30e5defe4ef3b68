//! Assistant personas
//!
//! A persona is a selector passed to both gateways and the source of the greeting
//! that seeds every new conversation. It carries no state of its own.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// The fixed set of assistant personas.
///
/// The wire form is the full display identifier, e.g. `"Arjun (Empathetic Counselor)"`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Persona {
    #[serde(rename = "Arjun (Empathetic Counselor)")]
    Arjun,
    #[serde(rename = "Anjali (Mindful Guide)")]
    Anjali,
    #[serde(rename = "Rohan (Insightful Therapist)")]
    Rohan,
    #[serde(rename = "Priya (Caring Mentor)")]
    Priya,
}

impl Persona {
    pub const ALL: [Persona; 4] = [
        Persona::Arjun,
        Persona::Anjali,
        Persona::Rohan,
        Persona::Priya,
    ];

    /// Full display identifier sent to the gateways
    pub fn display_name(self) -> &'static str {
        match self {
            Persona::Arjun => "Arjun (Empathetic Counselor)",
            Persona::Anjali => "Anjali (Mindful Guide)",
            Persona::Rohan => "Rohan (Insightful Therapist)",
            Persona::Priya => "Priya (Caring Mentor)",
        }
    }

    /// Given name, the first word of the display identifier
    pub fn given_name(self) -> &'static str {
        match self {
            Persona::Arjun => "Arjun",
            Persona::Anjali => "Anjali",
            Persona::Rohan => "Rohan",
            Persona::Priya => "Priya",
        }
    }

    /// One-line personality description
    pub fn description(self) -> &'static str {
        match self {
            Persona::Arjun => "Empathetic and wise counselor",
            Persona::Anjali => "Gentle and insightful guide",
            Persona::Rohan => "Pragmatic and understanding therapist",
            Persona::Priya => "Warm and nurturing mentor",
        }
    }

    /// Greeting that seeds a fresh conversation with this persona
    pub fn greeting(self) -> String {
        format!(
            "Hello! I'm {}, and I'm here to support your mental wellbeing. How are you feeling today?",
            self.given_name()
        )
    }

    pub fn info(self) -> PersonaInfo {
        PersonaInfo {
            id: self,
            name: self.given_name(),
            description: self.description(),
        }
    }
}

impl Default for Persona {
    fn default() -> Self {
        Persona::Arjun
    }
}

impl fmt::Display for Persona {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.display_name())
    }
}

/// Error returned when a string names no known persona
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("Unknown persona: {0}")]
pub struct UnknownPersona(pub String);

impl FromStr for Persona {
    type Err = UnknownPersona;

    /// Accepts either the full display identifier or the given name, ignoring case.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let wanted = s.trim().to_lowercase();
        Persona::ALL
            .into_iter()
            .find(|p| {
                p.display_name().to_lowercase() == wanted || p.given_name().to_lowercase() == wanted
            })
            .ok_or_else(|| UnknownPersona(s.to_string()))
    }
}

/// Catalog entry for the persona picker
#[derive(Debug, Clone, Serialize)]
pub struct PersonaInfo {
    pub id: Persona,
    pub name: &'static str,
    pub description: &'static str,
}

/// All personas in picker order
pub fn catalog() -> Vec<PersonaInfo> {
    Persona::ALL.into_iter().map(Persona::info).collect()
}
