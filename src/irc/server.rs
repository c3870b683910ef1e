//! Per-network policy.
//!
//! A `ServerPolicy` is an immutable view over one network's configuration.
//! Besides plain predicates it converts the user and alias templates into
//! regexes so the bridge can tell which room-side IDs it owns.

use std::time::Duration;

use fancy_regex::Regex;
use tracing::warn;

use crate::common::types::LocalIdentity;
use crate::config::types::{JoinRule, ServerConfig, SyncKinds};

/// Which way membership is mirrored.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncDirection {
    /// Room-side membership reflected as IRC joins/parts.
    ToIrc,
    /// IRC joins/parts reflected into rooms.
    ToRemote,
}

/// Whether a sync is the startup bulk sync or a live change.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncKind {
    Initial,
    Incremental,
}

impl SyncKinds {
    fn get(&self, kind: SyncKind) -> bool {
        match kind {
            SyncKind::Initial => self.initial,
            SyncKind::Incremental => self.incremental,
        }
    }
}

/// Immutable policy for one configured IRC network.
#[derive(Debug, Clone)]
pub struct ServerPolicy {
    domain: String,
    config: ServerConfig,
}

impl ServerPolicy {
    pub fn new(domain: impl Into<String>, config: ServerConfig) -> Self {
        Self {
            domain: domain.into(),
            config,
        }
    }

    pub fn domain(&self) -> &str {
        &self.domain
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    // ========================================================================
    // Predicates
    // ========================================================================

    pub fn port(&self) -> u16 {
        self.config.port
    }

    pub fn use_ssl(&self) -> bool {
        self.config.ssl
    }

    pub fn is_bot_enabled(&self) -> bool {
        self.config.bot_config.enabled
    }

    pub fn join_rule(&self) -> JoinRule {
        self.config.dynamic_channels.join_rule
    }

    /// `None` when idle disconnection is turned off.
    pub fn idle_timeout(&self) -> Option<Duration> {
        match self.config.irc_clients.idle_timeout {
            0 => None,
            secs => Some(Duration::from_secs(secs)),
        }
    }

    /// Advisory: exceeding it only logs a warning.
    pub fn max_clients(&self) -> usize {
        self.config.irc_clients.max_clients
    }

    pub fn is_excluded_channel(&self, channel: &str) -> bool {
        self.config
            .dynamic_channels
            .exclude
            .iter()
            .any(|c| c == channel)
    }

    pub fn allows_pms(&self) -> bool {
        self.config.private_messages.enabled
    }

    pub fn should_publish_rooms(&self) -> bool {
        self.config.dynamic_channels.published
    }

    pub fn allows_nick_changes(&self) -> bool {
        self.config.irc_clients.allow_nick_changes
    }

    pub fn has_invite_rooms(&self) -> bool {
        self.config.dynamic_channels.enabled && self.join_rule() == JoinRule::Invite
    }

    /// Dynamic rooms are created with an alias.
    pub fn creates_dynamic_aliases(&self) -> bool {
        self.config.dynamic_channels.enabled && self.config.dynamic_channels.create_alias
    }

    /// Dynamic rooms are joinable through their alias alone.
    pub fn creates_public_aliases(&self) -> bool {
        self.creates_dynamic_aliases() && self.join_rule() == JoinRule::Public
    }

    pub fn should_join_channels_if_no_users(&self) -> bool {
        self.config.bot_config.join_channels_if_no_users
    }

    pub fn is_membership_lists_enabled(&self) -> bool {
        self.config.membership_lists.enabled
    }

    pub fn bot_identity(&self) -> LocalIdentity {
        LocalIdentity::bot(
            self.domain.clone(),
            self.config.bot_config.nick.clone(),
            self.config.bot_config.password.clone(),
        )
    }

    /// Static channel -> room mappings.
    pub fn mappings(&self) -> impl Iterator<Item = (&str, &str)> {
        self.config
            .mappings
            .iter()
            .flat_map(|(channel, rooms)| rooms.iter().map(move |r| (channel.as_str(), r.as_str())))
    }

    // ========================================================================
    // Membership sync
    // ========================================================================

    /// Resolve whether membership of `kind` is mirrored in `direction`.
    ///
    /// `scope` is a room ID for `ToIrc` and a channel for `ToRemote`. Matching
    /// overrides are applied in configuration order; the last one wins.
    pub fn should_sync_membership(
        &self,
        direction: SyncDirection,
        kind: SyncKind,
        scope: Option<&str>,
    ) -> bool {
        let lists = &self.config.membership_lists;
        if !lists.enabled {
            return false;
        }

        let mut should_sync = match direction {
            SyncDirection::ToIrc => lists.global.matrix_to_irc.get(kind),
            SyncDirection::ToRemote => lists.global.irc_to_matrix.get(kind),
        };

        let Some(scope) = scope else {
            return should_sync;
        };

        match direction {
            SyncDirection::ToIrc => {
                for rule in lists.rooms.iter().filter(|r| r.room == scope) {
                    if let Some(kinds) = rule.matrix_to_irc {
                        should_sync = kinds.get(kind);
                    }
                }
            }
            SyncDirection::ToRemote => {
                for rule in lists.channels.iter().filter(|c| c.channel == scope) {
                    if let Some(kinds) = rule.irc_to_matrix {
                        should_sync = kinds.get(kind);
                    }
                }
            }
        }

        should_sync
    }

    pub fn should_sync_membership_to_irc(&self, kind: SyncKind, room_id: Option<&str>) -> bool {
        self.should_sync_membership(SyncDirection::ToIrc, kind, room_id)
    }

    pub fn should_sync_membership_to_remote(&self, kind: SyncKind, channel: Option<&str>) -> bool {
        self.should_sync_membership(SyncDirection::ToRemote, kind, channel)
    }

    // ========================================================================
    // Templates
    // ========================================================================

    /// Localpart of the virtual user standing in for `nick`.
    pub fn user_localpart(&self, nick: &str) -> String {
        let uid = self
            .config
            .matrix_clients
            .user_template
            .replace("$SERVER", &self.domain)
            .replace("$NICK", nick);
        uid.strip_prefix('@').map(str::to_string).unwrap_or(uid)
    }

    /// Full virtual user ID for `nick` on the homeserver `hs_domain`.
    pub fn user_id_for_nick(&self, nick: &str, hs_domain: &str) -> String {
        format!("@{}:{}", self.user_localpart(nick), hs_domain)
    }

    /// Display name of the virtual user standing in for `nick`.
    pub fn display_name_for_nick(&self, nick: &str) -> String {
        self.config.matrix_clients.display_name.replace("$NICK", nick)
    }

    pub fn claims_user_id(&self, user_id: &str) -> bool {
        let pattern = self.user_pattern("(.*)");
        is_match(&pattern, user_id)
    }

    pub fn nick_from_user_id(&self, user_id: &str) -> Option<String> {
        let pattern = self.user_pattern("(.*)");
        capture(&pattern, user_id)
    }

    pub fn claims_alias(&self, alias: &str) -> bool {
        let pattern = self.alias_pattern("(.*)");
        is_match(&pattern, alias)
    }

    pub fn channel_from_alias(&self, alias: &str) -> Option<String> {
        let pattern = self.alias_pattern("([^:]*)");
        capture(&pattern, alias)
    }

    /// Alias localpart for `channel`, the inverse of `channel_from_alias`.
    pub fn alias_localpart(&self, channel: &str) -> String {
        let alias = self
            .config
            .dynamic_channels
            .alias_template
            .replace("$SERVER", &self.domain)
            .replace("$CHANNEL", channel);
        alias.strip_prefix('#').map(str::to_string).unwrap_or(alias)
    }

    /// Regex over every alias this network may create.
    pub fn alias_regex(&self) -> String {
        self.alias_pattern(".*")
    }

    /// Regex over every virtual user ID this network may create.
    pub fn user_regex(&self) -> String {
        self.user_pattern(".*")
    }

    /// Nick for a room-side user, from the nick template.
    pub fn nick_for(&self, user_id: &str, display_name: Option<&str>) -> String {
        let localpart = user_id
            .strip_prefix('@')
            .unwrap_or(user_id)
            .split(':')
            .next()
            .unwrap_or_default();
        let display = display_name.filter(|d| !d.is_empty()).unwrap_or(localpart);

        self.config
            .irc_clients
            .nick_template
            .replace("$USERID", user_id)
            .replace("$LOCALPART", localpart)
            .replace("$DISPLAY", display)
    }

    fn user_pattern(&self, nick_var: &str) -> String {
        template_to_regex(
            &self.config.matrix_clients.user_template,
            &[("$SERVER", &self.domain)],
            &[("$NICK", nick_var)],
            ":.*",
        )
    }

    fn alias_pattern(&self, channel_var: &str) -> String {
        template_to_regex(
            &self.config.dynamic_channels.alias_template,
            &[("$SERVER", &self.domain)],
            &[("$CHANNEL", channel_var)],
            ":.*",
        )
    }
}

// ============================================================================
// Template helpers
// ============================================================================

/// Escape every regex metacharacter in `s`.
pub fn escape_regex(s: &str) -> String {
    let mut out = String::with_capacity(s.len() * 2);
    for c in s.chars() {
        if matches!(
            c,
            '.' | '*' | '+' | '?' | '^' | '$' | '{' | '}' | '(' | ')' | '|' | '[' | ']' | '\\'
        ) {
            out.push('\\');
        }
        out.push(c);
    }
    out
}

/// Turn a literal template into a regex.
///
/// Literal variables are substituted first, then the whole string is escaped,
/// then the escaped form of each regex variable is replaced by its pattern.
pub fn template_to_regex(
    template: &str,
    literal_vars: &[(&str, &str)],
    regex_vars: &[(&str, &str)],
    suffix: &str,
) -> String {
    let mut literal = template.to_string();
    for (placeholder, value) in literal_vars {
        literal = literal.replace(placeholder, value);
    }

    let mut regex = escape_regex(&literal);
    for (placeholder, pattern) in regex_vars {
        regex = regex.replace(&escape_regex(placeholder), pattern);
    }

    regex.push_str(suffix);
    regex
}

fn compile(pattern: &str) -> Option<Regex> {
    match Regex::new(&format!("^{}", pattern)) {
        Ok(regex) => Some(regex),
        Err(e) => {
            warn!("Invalid template regex '{}': {}", pattern, e);
            None
        }
    }
}

fn is_match(pattern: &str, input: &str) -> bool {
    compile(pattern)
        .map(|re| {
            re.is_match(input).unwrap_or_else(|e| {
                warn!("Regex match error for pattern '{}': {}", pattern, e);
                false
            })
        })
        .unwrap_or(false)
}

fn capture(pattern: &str, input: &str) -> Option<String> {
    let re = compile(pattern)?;
    match re.captures(input) {
        Ok(Some(caps)) => caps.get(1).map(|m| m.as_str().to_string()),
        Ok(None) => None,
        Err(e) => {
            warn!("Regex match error for pattern '{}': {}", pattern, e);
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::types::{ChannelMembershipRule, RoomMembershipRule};

    fn make_test_policy() -> ServerPolicy {
        let mut config = ServerConfig::default();
        config.matrix_clients.user_template = "@irc_$SERVER_$NICK".to_string();
        config.dynamic_channels.alias_template = "#irc_$SERVER_$CHANNEL".to_string();
        config.dynamic_channels.exclude = vec!["#secret".to_string()];
        ServerPolicy::new("irc.example.org", config)
    }

    #[test]
    fn test_escape_regex() {
        assert_eq!(escape_regex("a.b"), "a\\.b");
        assert_eq!(escape_regex("$NICK"), "\\$NICK");
        assert_eq!(escape_regex("[x](y)"), "\\[x\\]\\(y\\)");
    }

    #[test]
    fn test_user_regex() {
        let policy = make_test_policy();
        assert_eq!(policy.user_regex(), "@irc_irc\\.example\\.org_.*:.*");
    }

    #[test]
    fn test_user_template_round_trip() {
        let policy = make_test_policy();
        for nick in ["alice", "Bob[away]", "x^y", "a.b"] {
            let user_id = policy.user_id_for_nick(nick, "localhost");
            assert!(policy.claims_user_id(&user_id), "{} not claimed", user_id);
            assert_eq!(policy.nick_from_user_id(&user_id).as_deref(), Some(nick));
        }
    }

    #[test]
    fn test_does_not_claim_other_domain() {
        let policy = make_test_policy();
        let other = ServerPolicy::new("irc.other.net", policy.config().clone());

        let user_id = other.user_id_for_nick("alice", "localhost");
        assert!(!policy.claims_user_id(&user_id));
        assert!(!policy.claims_user_id("@alice:localhost"));
        // The domain's dots are literal.
        assert!(!policy.claims_user_id("@irc_ircXexampleXorg_alice:localhost"));
    }

    #[test]
    fn test_alias_round_trip() {
        let policy = make_test_policy();
        let alias = format!("#{}:localhost", policy.alias_localpart("#rust"));
        assert_eq!(alias, "#irc_irc.example.org_#rust:localhost");
        assert!(policy.claims_alias(&alias));
        assert_eq!(policy.channel_from_alias(&alias).as_deref(), Some("#rust"));
    }

    #[test]
    fn test_nick_for_template() {
        let mut config = ServerConfig::default();
        config.irc_clients.nick_template = "M-$DISPLAY".to_string();
        let policy = ServerPolicy::new("irc.example.org", config);

        assert_eq!(policy.nick_for("@alice:hs", Some("Alice")), "M-Alice");
        assert_eq!(policy.nick_for("@alice:hs", None), "M-alice");

        let mut config = ServerConfig::default();
        config.irc_clients.nick_template = "$LOCALPART|$USERID".to_string();
        let policy = ServerPolicy::new("irc.example.org", config);
        assert_eq!(policy.nick_for("@alice:hs", None), "alice|@alice:hs");
    }

    #[test]
    fn test_membership_sync_disabled() {
        let mut config = ServerConfig::default();
        config.membership_lists.global.matrix_to_irc.initial = true;
        let policy = ServerPolicy::new("irc.example.org", config);

        assert!(!policy.should_sync_membership_to_irc(SyncKind::Initial, None));
    }

    #[test]
    fn test_membership_sync_overrides_last_wins() {
        let mut config = ServerConfig::default();
        config.membership_lists.enabled = true;
        config.membership_lists.global.matrix_to_irc.incremental = true;
        config.membership_lists.rooms = vec![
            RoomMembershipRule {
                room: "!a:hs".to_string(),
                matrix_to_irc: Some(SyncKinds {
                    initial: true,
                    incremental: false,
                }),
            },
            RoomMembershipRule {
                room: "!a:hs".to_string(),
                matrix_to_irc: Some(SyncKinds {
                    initial: false,
                    incremental: true,
                }),
            },
            RoomMembershipRule {
                room: "!b:hs".to_string(),
                matrix_to_irc: Some(SyncKinds::default()),
            },
        ];
        config.membership_lists.channels = vec![ChannelMembershipRule {
            channel: "#rust".to_string(),
            irc_to_matrix: Some(SyncKinds {
                initial: true,
                incremental: true,
            }),
        }];
        let policy = ServerPolicy::new("irc.example.org", config);

        assert!(policy.should_sync_membership_to_irc(SyncKind::Incremental, None));
        assert!(policy.should_sync_membership_to_irc(SyncKind::Incremental, Some("!a:hs")));
        assert!(!policy.should_sync_membership_to_irc(SyncKind::Initial, Some("!a:hs")));
        assert!(!policy.should_sync_membership_to_irc(SyncKind::Incremental, Some("!b:hs")));

        assert!(!policy.should_sync_membership_to_remote(SyncKind::Initial, None));
        assert!(policy.should_sync_membership_to_remote(SyncKind::Initial, Some("#rust")));
    }

    #[test]
    fn test_alias_eligibility() {
        let mut config = ServerConfig::default();
        config.dynamic_channels.enabled = false;
        config.dynamic_channels.create_alias = true;
        assert!(!ServerPolicy::new("d", config.clone()).creates_dynamic_aliases());

        config.dynamic_channels.enabled = true;
        let policy = ServerPolicy::new("d", config.clone());
        assert!(policy.creates_dynamic_aliases());
        assert!(policy.creates_public_aliases());

        config.dynamic_channels.join_rule = JoinRule::Invite;
        let policy = ServerPolicy::new("d", config);
        assert!(policy.creates_dynamic_aliases());
        assert!(!policy.creates_public_aliases());
        assert!(policy.has_invite_rooms());
    }

    #[test]
    fn test_predicates() {
        let policy = make_test_policy();
        assert!(policy.is_excluded_channel("#secret"));
        assert!(!policy.is_excluded_channel("#rust"));
        assert_eq!(policy.idle_timeout(), Some(Duration::from_secs(172_800)));
        assert!(policy.bot_identity().is_bot);
        assert_eq!(policy.bot_identity().nick, "appservicebot");
    }
}
