//! Turns raw migration files into validated, version-ordered migrations.

use std::collections::BTreeMap;

use crate::source::MigrationSource;
use crate::{MigrationError, Result};

/// A versioned schema change with its forward and reverse SQL.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Migration {
    pub version: i64,
    pub name: String,
    pub up: String,
    pub down: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Direction {
    Up,
    Down,
}

impl Direction {
    fn as_str(self) -> &'static str {
        match self {
            Direction::Up => "up",
            Direction::Down => "down",
        }
    }
}

#[derive(Default)]
struct Pair {
    up: Option<(String, String)>,
    down: Option<(String, String)>,
}

/// Splits `<version>_<name>.<up|down>[.sql]` into its parts.
fn parse_file_name(file: &str) -> Result<(i64, String, Direction)> {
    let invalid = |reason| MigrationError::InvalidFileName {
        file: file.to_string(),
        reason,
    };

    let stem = file.strip_suffix(".sql").unwrap_or(file);
    let (stem, direction) = stem
        .rsplit_once('.')
        .ok_or_else(|| invalid("missing .up or .down suffix"))?;
    let direction = match direction {
        "up" => Direction::Up,
        "down" => Direction::Down,
        _ => return Err(invalid("direction must be up or down")),
    };

    let (version, name) = stem
        .split_once('_')
        .ok_or_else(|| invalid("expected <version>_<name>"))?;
    let version: i64 = version
        .parse()
        .map_err(|_| invalid("version is not a number"))?;
    if version <= 0 {
        return Err(invalid("version must be positive"));
    }
    if name.is_empty() {
        return Err(invalid("name is empty"));
    }

    Ok((version, name.to_string(), direction))
}

/// Loads and validates every migration of `source`, ordered by version.
///
/// Fails if a version lacks either direction, defines one twice, has an
/// empty body, or names its two files differently.
pub fn discover(source: &dyn MigrationSource) -> Result<Vec<Migration>> {
    let mut pairs: BTreeMap<i64, Pair> = BTreeMap::new();

    for file in source.files()? {
        let (version, name, direction) = parse_file_name(&file.name)?;
        if file.body.trim().is_empty() {
            return Err(MigrationError::EmptyBody {
                version,
                direction: direction.as_str(),
            });
        }

        let pair = pairs.entry(version).or_default();
        let slot = match direction {
            Direction::Up => &mut pair.up,
            Direction::Down => &mut pair.down,
        };
        if slot.is_some() {
            return Err(MigrationError::DuplicateDirection {
                version,
                direction: direction.as_str(),
            });
        }
        *slot = Some((name, file.body));
    }

    pairs
        .into_iter()
        .map(|(version, pair)| {
            let (up_name, up) = pair.up.ok_or(MigrationError::MissingDirection {
                version,
                direction: "up",
            })?;
            let (down_name, down) = pair.down.ok_or(MigrationError::MissingDirection {
                version,
                direction: "down",
            })?;
            if up_name != down_name {
                return Err(MigrationError::NameMismatch {
                    version,
                    up: up_name,
                    down: down_name,
                });
            }
            Ok(Migration {
                version,
                name: up_name,
                up,
                down,
            })
        })
        .collect()
}
