mod common;

use russy_core::{RoomError, RoomResolver};

use common::FakeChat;

#[tokio::test]
async fn resolves_joins_and_caches() {
    let chat = FakeChat::with_alias("#news:example.org", "!news:example.org");
    let resolver = RoomResolver::new(chat.clone());

    let first = resolver.resolve("#news:example.org").await.unwrap();
    let second = resolver.resolve("#news:example.org").await.unwrap();

    assert_eq!(first, "!news:example.org");
    assert_eq!(second, first);
    assert_eq!(chat.resolve_calls(), 1);
    assert_eq!(chat.join_calls(), 1);
    assert!(chat.is_joined("!news:example.org"));

    let cached = resolver.cached("#news:example.org").await.unwrap();
    assert_eq!(cached.room_id, "!news:example.org");
    assert!(!cached.stale);
}

#[tokio::test]
async fn joining_an_already_joined_room_succeeds() {
    let chat = FakeChat::with_alias("#news:example.org", "!news:example.org");
    let resolver = RoomResolver::new(chat.clone());

    resolver.resolve("#news:example.org").await.unwrap();
    assert_eq!(resolver.invalidate_room("!news:example.org").await, 1);
    let again = resolver.resolve("#news:example.org").await.unwrap();

    assert_eq!(again, "!news:example.org");
    assert_eq!(chat.join_calls(), 2);
    assert_eq!(chat.resolve_calls(), 2);
}

#[tokio::test]
async fn room_ids_skip_alias_resolution() {
    let chat = FakeChat::new();
    let resolver = RoomResolver::new(chat.clone());

    let room_id = resolver.resolve("!direct:example.org").await.unwrap();
    assert_eq!(room_id, "!direct:example.org");
    assert_eq!(chat.resolve_calls(), 0);
    assert_eq!(chat.join_calls(), 1);
}

#[tokio::test]
async fn unknown_alias_is_unresolvable_and_not_cached() {
    let chat = FakeChat::new();
    let resolver = RoomResolver::new(chat.clone());

    let err = resolver.resolve("#missing:example.org").await.unwrap_err();
    let RoomError::Unresolvable { alias, .. } = err;
    assert_eq!(alias, "#missing:example.org");
    assert!(resolver.cached("#missing:example.org").await.is_none());
    assert_eq!(chat.join_calls(), 0);

    // Fixed on the server side: the next call resolves.
    chat.add_alias("#missing:example.org", "!found:example.org");
    assert_eq!(
        resolver.resolve("#missing:example.org").await.unwrap(),
        "!found:example.org"
    );
}

#[tokio::test]
async fn invalidation_forces_re_resolution_to_new_room() {
    let chat = FakeChat::with_alias("#news:example.org", "!old:example.org");
    let resolver = RoomResolver::new(chat.clone());
    resolver.resolve("#news:example.org").await.unwrap();

    chat.add_alias("#news:example.org", "!new:example.org");
    assert_eq!(
        resolver.resolve("#news:example.org").await.unwrap(),
        "!old:example.org"
    );

    resolver.invalidate_alias("#news:example.org").await;
    assert!(resolver.cached("#news:example.org").await.unwrap().stale);
    assert_eq!(
        resolver.resolve("#news:example.org").await.unwrap(),
        "!new:example.org"
    );
}

#[tokio::test]
async fn warm_up_counts_joined_rooms() {
    let chat = FakeChat::with_alias("#a:example.org", "!a:example.org");
    let resolver = RoomResolver::new(chat.clone());

    let joined = resolver
        .warm_up(["#a:example.org", "#missing:example.org", "!b:example.org"])
        .await;
    assert_eq!(joined, 2);
}
