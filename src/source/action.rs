//! The disposition-action mini-language used in fetcher settings.
//!
//! An entry is `mark_seen`, `delete`, or `move_to:<mailbox>`. Resolution
//! is forgiving: entries that do not parse are dropped without a word, and
//! an empty result falls back to the kind-specific default.

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActionKind {
    MarkSeen,
    Move,
    Delete,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceAction {
    pub kind: ActionKind,
    pub param: Option<String>,
}

impl SourceAction {
    /// Parse a single entry. `None` for anything malformed.
    pub fn parse(entry: &str) -> Option<Self> {
        let (name, param) = match entry.split_once(':') {
            Some((name, param)) => (name, Some(param).filter(|p| !p.is_empty())),
            None => (entry, None),
        };
        match name {
            "mark_seen" if param.is_none() => Some(Self {
                kind: ActionKind::MarkSeen,
                param: None,
            }),
            "delete" if param.is_none() => Some(Self {
                kind: ActionKind::Delete,
                param: None,
            }),
            "move_to" => param.map(|param| Self {
                kind: ActionKind::Move,
                param: Some(param.to_string()),
            }),
            _ => None,
        }
    }

    /// Resolve a settings list into the actions to run, in order.
    ///
    /// Duplicate kinds keep the first occurrence. With `basename_only`,
    /// move targets containing a path separator are dropped. When nothing
    /// survives, `default` (assumed well-formed) takes over.
    pub fn from_settings(entries: &[String], basename_only: bool, default: &str) -> Vec<Self> {
        let mut actions: Vec<Self> = Vec::new();
        for entry in entries {
            let Some(action) = Self::parse(entry) else {
                continue;
            };
            if basename_only
                && let Some(param) = &action.param
                && (param.contains('/') || param.contains('\\'))
            {
                continue;
            }
            if actions.iter().any(|seen| seen.kind == action.kind) {
                continue;
            }
            actions.push(action);
        }
        if actions.is_empty()
            && let Some(action) = Self::parse(default)
        {
            actions.push(action);
        }
        actions
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn settings(entries: &[&str]) -> Vec<String> {
        entries.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn parses_the_three_forms() {
        assert_eq!(
            SourceAction::parse("mark_seen"),
            Some(SourceAction {
                kind: ActionKind::MarkSeen,
                param: None
            })
        );
        assert_eq!(
            SourceAction::parse("delete"),
            Some(SourceAction {
                kind: ActionKind::Delete,
                param: None
            })
        );
        assert_eq!(
            SourceAction::parse("move_to:done"),
            Some(SourceAction {
                kind: ActionKind::Move,
                param: Some("done".to_string())
            })
        );
    }

    #[test]
    fn malformed_entries_are_dropped() {
        assert_eq!(SourceAction::parse(""), None);
        assert_eq!(SourceAction::parse("move_to"), None);
        assert_eq!(SourceAction::parse("move_to:"), None);
        assert_eq!(SourceAction::parse("mark_seen:x"), None);
        assert_eq!(SourceAction::parse("delete:now"), None);
        assert_eq!(SourceAction::parse("shred"), None);
    }

    #[test]
    fn first_of_each_kind_wins() {
        let actions = SourceAction::from_settings(
            &settings(&["move_to:first", "mark_seen", "move_to:second"]),
            false,
            "delete",
        );
        assert_eq!(actions.len(), 2);
        assert_eq!(actions[0].param.as_deref(), Some("first"));
        assert_eq!(actions[1].kind, ActionKind::MarkSeen);
    }

    #[test]
    fn empty_or_all_invalid_falls_back_to_default() {
        let actions = SourceAction::from_settings(&[], false, "mark_seen");
        assert_eq!(actions, vec![SourceAction::parse("mark_seen").unwrap()]);

        let actions = SourceAction::from_settings(
            &settings(&["bogus", "move_to:"]),
            false,
            "move_to:failed",
        );
        assert_eq!(actions, vec![SourceAction::parse("move_to:failed").unwrap()]);
    }

    #[test]
    fn basename_restriction_drops_pathy_targets() {
        let actions = SourceAction::from_settings(
            &settings(&["move_to:../escape", "move_to:sub/dir", "move_to:ok"]),
            true,
            "delete",
        );
        assert_eq!(actions.len(), 1);
        assert_eq!(actions[0].param.as_deref(), Some("ok"));

        // Without the restriction the hierarchy delimiter is allowed.
        let actions =
            SourceAction::from_settings(&settings(&["move_to:archive/2023"]), false, "delete");
        assert_eq!(actions[0].param.as_deref(), Some("archive/2023"));
    }
}
