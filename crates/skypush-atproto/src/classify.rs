//! Classification of repository operations into notification events.

use serde::{Deserialize, Serialize};

use crate::frame::{OpAction, RepoCommit, RepoOperation};
use crate::records::{Follow, Like, Post, Record, Repost};
use crate::AtUri;

/// The kind of a [`FirehoseEvent`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EventKind {
    Like,
    Reply,
    Quote,
    Repost,
    Mention,
    Follow,
}

impl EventKind {
    pub const ALL: [EventKind; 6] = [
        EventKind::Like,
        EventKind::Reply,
        EventKind::Quote,
        EventKind::Repost,
        EventKind::Mention,
        EventKind::Follow,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            EventKind::Like => "like",
            EventKind::Reply => "reply",
            EventKind::Quote => "quote",
            EventKind::Repost => "repost",
            EventKind::Mention => "mention",
            EventKind::Follow => "follow",
        }
    }
}

impl std::fmt::Display for EventKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Something one account did that another account may want to hear about.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FirehoseEvent {
    #[serde(rename = "type")]
    pub kind: EventKind,
    /// The acting account.
    pub from_did: String,
    /// The account being notified.
    pub to_did: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub post_uri: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub quoted_uri: Option<String>,
}

impl FirehoseEvent {
    fn new(kind: EventKind, from_did: &str, to_did: &str) -> Self {
        Self {
            kind,
            from_did: from_did.to_string(),
            to_did: to_did.to_string(),
            post_uri: None,
            quoted_uri: None,
        }
    }

    fn with_post_uri(mut self, uri: impl Into<String>) -> Self {
        self.post_uri = Some(uri.into());
        self
    }

    /// Whether the actor and the recipient are the same account.
    pub fn is_self_event(&self) -> bool {
        self.from_did == self.to_did
    }
}

/// Classify every operation of a commit, in commit order.
pub fn classify_commit(commit: &RepoCommit) -> Vec<FirehoseEvent> {
    commit
        .ops
        .iter()
        .flat_map(|op| classify_operation(&commit.repo, op))
        .collect()
}

/// Classify one operation of `repo`.
///
/// Deletes never produce events, so un-likes and unfollows go unreported.
pub fn classify_operation(repo: &str, op: &RepoOperation) -> Vec<FirehoseEvent> {
    let record = match (op.action, &op.record) {
        (OpAction::Delete, _) | (_, None) => return Vec::new(),
        (_, Some(record)) => record,
    };

    match record {
        Record::Like(like) => classify_like(repo, like).into_iter().collect(),
        Record::Repost(repost) => classify_repost(repo, repost).into_iter().collect(),
        Record::Follow(follow) => classify_follow(repo, follow).into_iter().collect(),
        Record::Post(post) => {
            let uri = AtUri::new(repo, &op.collection, &op.rkey);
            if uri.validate().is_err() {
                return Vec::new();
            }
            classify_post(repo, &uri.to_string(), post)
        }
    }
}

fn classify_like(repo: &str, like: &Like) -> Option<FirehoseEvent> {
    let subject = like.subject.as_ref()?.uri.as_deref()?;
    let target = AtUri::parse(subject).ok()?;
    Some(FirehoseEvent::new(EventKind::Like, repo, &target.did).with_post_uri(subject))
}

fn classify_repost(repo: &str, repost: &Repost) -> Option<FirehoseEvent> {
    let subject = repost.subject.as_ref()?.uri.as_deref()?;
    let target = AtUri::parse(subject).ok()?;
    Some(FirehoseEvent::new(EventKind::Repost, repo, &target.did).with_post_uri(subject))
}

fn classify_follow(repo: &str, follow: &Follow) -> Option<FirehoseEvent> {
    let subject = follow.subject.as_deref().filter(|s| !s.is_empty())?;
    Some(FirehoseEvent::new(EventKind::Follow, repo, subject))
}

/// A post can reply, mention and quote at once; each is checked on its own.
fn classify_post(repo: &str, post_uri: &str, post: &Post) -> Vec<FirehoseEvent> {
    let mut events = Vec::new();

    if let Some(parent) = post.reply.as_ref().and_then(|r| r.target_uri())
        && let Ok(target) = AtUri::parse(parent)
    {
        events.push(FirehoseEvent::new(EventKind::Reply, repo, &target.did).with_post_uri(post_uri));
    }

    for did in post.mentioned_dids() {
        events.push(FirehoseEvent::new(EventKind::Mention, repo, did).with_post_uri(post_uri));
    }

    if let Some(quoted) = post.quoted_uri()
        && let Ok(target) = AtUri::parse(quoted)
    {
        let mut event =
            FirehoseEvent::new(EventKind::Quote, repo, &target.did).with_post_uri(post_uri);
        event.quoted_uri = Some(quoted.to_string());
        events.push(event);
    }

    events
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::records::{Embed, Facet, FacetFeature, RecordRef, ReplyRef};
    use pretty_assertions::assert_eq;

    const POST_URI: &str = "at://didB/app.bsky.feed.post/abc";

    fn op(collection: &str, record: Record) -> RepoOperation {
        RepoOperation {
            action: OpAction::Create,
            collection: collection.to_string(),
            rkey: "new".to_string(),
            record: Some(record),
        }
    }

    fn subject(uri: &str) -> Option<RecordRef> {
        Some(RecordRef {
            uri: Some(uri.to_string()),
        })
    }

    fn event(kind: EventKind, to: &str, post_uri: Option<&str>) -> FirehoseEvent {
        FirehoseEvent {
            kind,
            from_did: "didA".to_string(),
            to_did: to.to_string(),
            post_uri: post_uri.map(str::to_string),
            quoted_uri: None,
        }
    }

    #[test]
    fn test_like() {
        let like = Record::Like(Like {
            subject: subject(POST_URI),
        });
        assert_eq!(
            classify_operation("didA", &op("app.bsky.feed.like", like)),
            vec![event(EventKind::Like, "didB", Some(POST_URI))]
        );
    }

    #[test]
    fn test_like_without_subject() {
        let like = Record::Like(Like { subject: None });
        assert!(classify_operation("didA", &op("app.bsky.feed.like", like)).is_empty());

        let like = Record::Like(Like {
            subject: subject("https://not-an-at-uri"),
        });
        assert!(classify_operation("didA", &op("app.bsky.feed.like", like)).is_empty());
    }

    #[test]
    fn test_repost() {
        let repost = Record::Repost(Repost {
            subject: subject(POST_URI),
        });
        assert_eq!(
            classify_operation("didA", &op("app.bsky.feed.repost", repost)),
            vec![event(EventKind::Repost, "didB", Some(POST_URI))]
        );
    }

    #[test]
    fn test_follow() {
        let follow = Record::Follow(Follow {
            subject: Some("didB".to_string()),
        });
        assert_eq!(
            classify_operation("didA", &op("app.bsky.graph.follow", follow)),
            vec![event(EventKind::Follow, "didB", None)]
        );
    }

    #[test]
    fn test_reply_uses_parent_then_root() {
        let own_uri = "at://didA/app.bsky.feed.post/new";
        let post = Record::Post(Post {
            reply: Some(ReplyRef {
                root: subject("at://didRoot/app.bsky.feed.post/r"),
                parent: subject(POST_URI),
            }),
            ..Post::default()
        });
        assert_eq!(
            classify_operation("didA", &op("app.bsky.feed.post", post)),
            vec![event(EventKind::Reply, "didB", Some(own_uri))]
        );

        let post = Record::Post(Post {
            reply: Some(ReplyRef {
                root: subject("at://didRoot/app.bsky.feed.post/r"),
                parent: None,
            }),
            ..Post::default()
        });
        assert_eq!(
            classify_operation("didA", &op("app.bsky.feed.post", post)),
            vec![event(EventKind::Reply, "didRoot", Some(own_uri))]
        );
    }

    #[test]
    fn test_mention() {
        let post = Record::Post(Post {
            facets: vec![Facet {
                features: vec![
                    FacetFeature::Other,
                    FacetFeature::Mention {
                        did: "didM".to_string(),
                    },
                ],
            }],
            ..Post::default()
        });
        assert_eq!(
            classify_operation("didA", &op("app.bsky.feed.post", post)),
            vec![event(
                EventKind::Mention,
                "didM",
                Some("at://didA/app.bsky.feed.post/new")
            )]
        );
    }

    #[test]
    fn test_quote() {
        let post = Record::Post(Post {
            embed: Some(Embed::Quote {
                uri: POST_URI.to_string(),
            }),
            ..Post::default()
        });
        let mut expected = event(
            EventKind::Quote,
            "didB",
            Some("at://didA/app.bsky.feed.post/new"),
        );
        expected.quoted_uri = Some(POST_URI.to_string());
        assert_eq!(
            classify_operation("didA", &op("app.bsky.feed.post", post)),
            vec![expected]
        );
    }

    #[test]
    fn test_malformed_target_uris_are_dropped() {
        for quoted in [
            "at://did:plc:b/app.bsky.feed.post/a b",
            "at://did:plc:b/app.bsky.feed.post/a\n+ x y",
            "at://did:plc:b",
            "https://example.com/post",
        ] {
            let post = Record::Post(Post {
                reply: Some(ReplyRef {
                    root: None,
                    parent: subject(quoted),
                }),
                embed: Some(Embed::Quote {
                    uri: quoted.to_string(),
                }),
                ..Post::default()
            });
            assert!(
                classify_operation("didA", &op("app.bsky.feed.post", post)).is_empty(),
                "{quoted:?}"
            );
        }

        let like = Record::Like(Like {
            subject: subject("at://didB/app.bsky.feed.post/a b"),
        });
        assert!(classify_operation("didA", &op("app.bsky.feed.like", like)).is_empty());
    }

    #[test]
    fn test_post_with_malformed_rkey_yields_nothing() {
        let mut quote = op(
            "app.bsky.feed.post",
            Record::Post(Post {
                embed: Some(Embed::Quote {
                    uri: POST_URI.to_string(),
                }),
                ..Post::default()
            }),
        );
        quote.rkey = "r 1".to_string();
        assert!(classify_operation("didA", &quote).is_empty());
    }

    #[test]
    fn test_reply_mention_and_quote_together() {
        let post = Record::Post(Post {
            reply: Some(ReplyRef {
                root: None,
                parent: subject("at://didP/app.bsky.feed.post/p"),
            }),
            facets: vec![Facet {
                features: vec![FacetFeature::Mention {
                    did: "didM".to_string(),
                }],
            }],
            embed: Some(Embed::Quote {
                uri: "at://didQ/app.bsky.feed.post/q".to_string(),
            }),
            ..Post::default()
        });
        let kinds: Vec<(EventKind, String)> =
            classify_operation("didA", &op("app.bsky.feed.post", post))
                .into_iter()
                .map(|e| (e.kind, e.to_did))
                .collect();
        assert_eq!(
            kinds,
            vec![
                (EventKind::Reply, "didP".to_string()),
                (EventKind::Mention, "didM".to_string()),
                (EventKind::Quote, "didQ".to_string()),
            ]
        );
    }

    #[test]
    fn test_plain_post_yields_nothing() {
        let post = Record::Post(Post::default());
        assert!(classify_operation("didA", &op("app.bsky.feed.post", post)).is_empty());
    }

    #[test]
    fn test_deletes_are_not_classified() {
        let mut delete = op(
            "app.bsky.feed.like",
            Record::Like(Like {
                subject: subject(POST_URI),
            }),
        );
        delete.action = OpAction::Delete;
        assert!(classify_operation("didA", &delete).is_empty());
    }

    #[test]
    fn test_classify_commit_preserves_order() {
        let commit = RepoCommit {
            seq: 1,
            repo: "didA".to_string(),
            ops: vec![
                op(
                    "app.bsky.graph.follow",
                    Record::Follow(Follow {
                        subject: Some("didF".to_string()),
                    }),
                ),
                op(
                    "app.bsky.feed.like",
                    Record::Like(Like {
                        subject: subject(POST_URI),
                    }),
                ),
            ],
            skipped_ops: 0,
        };
        let kinds: Vec<EventKind> = classify_commit(&commit).into_iter().map(|e| e.kind).collect();
        assert_eq!(kinds, vec![EventKind::Follow, EventKind::Like]);
    }

    #[test]
    fn test_event_json_shape() {
        let like = event(EventKind::Like, "didB", Some(POST_URI));
        assert_eq!(
            serde_json::to_value(&like).unwrap(),
            serde_json::json!({
                "type": "like",
                "fromDid": "didA",
                "toDid": "didB",
                "postUri": POST_URI,
            })
        );
        assert!(!like.is_self_event());
        assert!(event(EventKind::Follow, "didA", None).is_self_event());
    }
}
