//! Course and usage key value objects
//!
//! Keys are plain values: they parse from and display to their canonical
//! string form, and serialize as that string. Stores always persist the
//! version-agnostic, branch-free form (see [`CourseKey::normalized`]).

use crate::{Error, Result};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::str::FromStr;

/// Learner (user) identifier
pub type LearnerId = i64;

const COURSE_PREFIX: &str = "course-v1:";
const BLOCK_PREFIX: &str = "block-v1:";

/// Identifier of a course run, optionally pinned to a branch and content version
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CourseKey {
    org: String,
    course: String,
    run: String,
    branch: Option<String>,
    version: Option<String>,
}

impl CourseKey {
    pub fn new(org: &str, course: &str, run: &str) -> Result<Self> {
        for part in [org, course, run] {
            validate_component(part)?;
        }
        Ok(Self {
            org: org.to_string(),
            course: course.to_string(),
            run: run.to_string(),
            branch: None,
            version: None,
        })
    }

    pub fn org(&self) -> &str {
        &self.org
    }

    pub fn course(&self) -> &str {
        &self.course
    }

    pub fn run(&self) -> &str {
        &self.run
    }

    pub fn branch(&self) -> Option<&str> {
        self.branch.as_deref()
    }

    pub fn version(&self) -> Option<&str> {
        self.version.as_deref()
    }

    /// Same course with the content version removed
    pub fn version_agnostic(&self) -> Self {
        Self {
            version: None,
            ..self.clone()
        }
    }

    /// Same course on another branch; `None` removes the branch
    pub fn for_branch(&self, branch: Option<&str>) -> Self {
        Self {
            branch: branch.map(str::to_string),
            ..self.clone()
        }
    }

    /// Pin to a content version
    pub fn for_version(&self, version: &str) -> Self {
        Self {
            version: Some(version.to_string()),
            ..self.clone()
        }
    }

    /// Version-agnostic, branch-free form used as the storage key
    pub fn normalized(&self) -> Self {
        self.version_agnostic().for_branch(None)
    }

    /// Filesystem-safe slug (used in report file names)
    pub fn slug(&self) -> String {
        format!("{}_{}_{}", self.org, self.course, self.run)
    }

    /// Build a usage key for a block in this course
    pub fn make_usage_key(&self, block_type: &str, block_id: &str) -> Result<UsageKey> {
        validate_component(block_type)?;
        validate_component(block_id)?;
        Ok(UsageKey {
            course: self.clone(),
            block_type: block_type.to_string(),
            block_id: block_id.to_string(),
        })
    }

    fn write_body(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}+{}+{}", self.org, self.course, self.run)?;
        if let Some(branch) = &self.branch {
            write!(f, "+branch@{}", branch)?;
        }
        if let Some(version) = &self.version {
            write!(f, "+version@{}", version)?;
        }
        Ok(())
    }
}

impl fmt::Display for CourseKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(COURSE_PREFIX)?;
        self.write_body(f)
    }
}

impl FromStr for CourseKey {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let body = s
            .strip_prefix(COURSE_PREFIX)
            .ok_or_else(|| Error::InvalidInput(format!("Not a course key: {}", s)))?;
        let parsed = ParsedBody::parse(body, s)?;
        if parsed.block_type.is_some() || parsed.block_id.is_some() {
            return Err(Error::InvalidInput(format!(
                "Course key may not name a block: {}",
                s
            )));
        }
        Ok(parsed.course)
    }
}

/// Identifier of a block (problem, subsection, ...) inside a course
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct UsageKey {
    course: CourseKey,
    block_type: String,
    block_id: String,
}

impl UsageKey {
    pub fn course_key(&self) -> &CourseKey {
        &self.course
    }

    pub fn block_type(&self) -> &str {
        &self.block_type
    }

    pub fn block_id(&self) -> &str {
        &self.block_id
    }

    pub fn version_agnostic(&self) -> Self {
        Self {
            course: self.course.version_agnostic(),
            ..self.clone()
        }
    }

    pub fn for_branch(&self, branch: Option<&str>) -> Self {
        Self {
            course: self.course.for_branch(branch),
            ..self.clone()
        }
    }

    pub fn normalized(&self) -> Self {
        Self {
            course: self.course.normalized(),
            ..self.clone()
        }
    }
}

impl fmt::Display for UsageKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(BLOCK_PREFIX)?;
        self.course.write_body(f)?;
        write!(f, "+type@{}+block@{}", self.block_type, self.block_id)
    }
}

impl FromStr for UsageKey {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let body = s
            .strip_prefix(BLOCK_PREFIX)
            .ok_or_else(|| Error::InvalidInput(format!("Not a usage key: {}", s)))?;
        let parsed = ParsedBody::parse(body, s)?;
        match (parsed.block_type, parsed.block_id) {
            (Some(block_type), Some(block_id)) => Ok(UsageKey {
                course: parsed.course,
                block_type,
                block_id,
            }),
            _ => Err(Error::InvalidInput(format!(
                "Usage key needs type@ and block@ parts: {}",
                s
            ))),
        }
    }
}

struct ParsedBody {
    course: CourseKey,
    block_type: Option<String>,
    block_id: Option<String>,
}

impl ParsedBody {
    fn parse(body: &str, original: &str) -> Result<Self> {
        let mut parts = body.split('+');
        let mut next_plain = |what: &str| -> Result<String> {
            let part = parts
                .next()
                .ok_or_else(|| Error::InvalidInput(format!("Missing {} in key: {}", what, original)))?;
            validate_component(part)?;
            Ok(part.to_string())
        };
        let org = next_plain("org")?;
        let course = next_plain("course")?;
        let run = next_plain("run")?;

        let mut parsed = ParsedBody {
            course: CourseKey {
                org,
                course,
                run,
                branch: None,
                version: None,
            },
            block_type: None,
            block_id: None,
        };

        for part in parts {
            let (tag, value) = part
                .split_once('@')
                .ok_or_else(|| Error::InvalidInput(format!("Malformed key part '{}' in {}", part, original)))?;
            validate_component(value)?;
            let slot = match tag {
                "branch" => &mut parsed.course.branch,
                "version" => &mut parsed.course.version,
                "type" => &mut parsed.block_type,
                "block" => &mut parsed.block_id,
                other => {
                    return Err(Error::InvalidInput(format!(
                        "Unknown key tag '{}' in {}",
                        other, original
                    )))
                }
            };
            if slot.is_some() {
                return Err(Error::InvalidInput(format!(
                    "Duplicate key tag '{}' in {}",
                    tag, original
                )));
            }
            *slot = Some(value.to_string());
        }

        Ok(parsed)
    }
}

fn validate_component(part: &str) -> Result<()> {
    if part.is_empty() {
        return Err(Error::InvalidInput("Empty key component".to_string()));
    }
    if part
        .chars()
        .any(|c| c.is_whitespace() || matches!(c, '+' | '@' | ':' | '/'))
    {
        return Err(Error::InvalidInput(format!(
            "Invalid character in key component '{}'",
            part
        )));
    }
    Ok(())
}

macro_rules! string_serde {
    ($ty:ty) => {
        impl Serialize for $ty {
            fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
                serializer.collect_str(self)
            }
        }

        impl<'de> Deserialize<'de> for $ty {
            fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
                let raw = String::deserialize(deserializer)?;
                raw.parse().map_err(serde::de::Error::custom)
            }
        }
    };
}

string_serde!(CourseKey);
string_serde!(UsageKey);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_course_key_round_trip() {
        let key: CourseKey = "course-v1:MITx+6.002x+2024_T1".parse().unwrap();
        assert_eq!(key.org(), "MITx");
        assert_eq!(key.course(), "6.002x");
        assert_eq!(key.run(), "2024_T1");
        assert_eq!(key.to_string(), "course-v1:MITx+6.002x+2024_T1");
    }

    #[test]
    fn test_course_key_strips_version_and_branch() {
        let key: CourseKey = "course-v1:Org+C1+R1+branch@draft+version@abc123".parse().unwrap();
        assert_eq!(key.branch(), Some("draft"));
        assert_eq!(key.version(), Some("abc123"));

        let agnostic = key.version_agnostic();
        assert_eq!(agnostic.to_string(), "course-v1:Org+C1+R1+branch@draft");
        assert_eq!(key.for_branch(None).to_string(), "course-v1:Org+C1+R1+version@abc123");
        assert_eq!(key.normalized().to_string(), "course-v1:Org+C1+R1");
    }

    #[test]
    fn test_usage_key_round_trip_and_course() {
        let raw = "block-v1:Org+C1+R1+type@problem+block@p1";
        let key: UsageKey = raw.parse().unwrap();
        assert_eq!(key.block_type(), "problem");
        assert_eq!(key.block_id(), "p1");
        assert_eq!(key.course_key().to_string(), "course-v1:Org+C1+R1");
        assert_eq!(key.to_string(), raw);
    }

    #[test]
    fn test_usage_key_normalized_drops_version() {
        let key: UsageKey = "block-v1:Org+C1+R1+branch@published+version@v9+type@sequential+block@s1"
            .parse()
            .unwrap();
        assert_eq!(
            key.normalized().to_string(),
            "block-v1:Org+C1+R1+type@sequential+block@s1"
        );
    }

    #[test]
    fn test_rejects_malformed_keys() {
        assert!("course-v1:Org+C1".parse::<CourseKey>().is_err());
        assert!("course-v1:Org+C1+R1+type@problem+block@p1".parse::<CourseKey>().is_err());
        assert!("block-v1:Org+C1+R1+type@problem".parse::<UsageKey>().is_err());
        assert!("block-v1:Org+C1+R1+color@red+type@problem+block@p".parse::<UsageKey>().is_err());
        assert!("i4x://Org/C1/problem/p1".parse::<UsageKey>().is_err());
        assert!("course-v1:Org+C 1+R1".parse::<CourseKey>().is_err());
    }

    #[test]
    fn test_keys_serialize_as_strings() {
        let key: UsageKey = "block-v1:Org+C1+R1+type@problem+block@p1".parse().unwrap();
        let json = serde_json::to_string(&key).unwrap();
        assert_eq!(json, "\"block-v1:Org+C1+R1+type@problem+block@p1\"");
        let back: UsageKey = serde_json::from_str(&json).unwrap();
        assert_eq!(back, key);

        let bad: std::result::Result<CourseKey, _> = serde_json::from_str("\"nope\"");
        assert!(bad.is_err());
    }

    #[test]
    fn test_make_usage_key() {
        let course = CourseKey::new("Org", "C1", "R1").unwrap();
        let block = course.make_usage_key("problem", "p7").unwrap();
        assert_eq!(block.course_key(), &course);
        assert_eq!(course.slug(), "Org_C1_R1");
    }
}
