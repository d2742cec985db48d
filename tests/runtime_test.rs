//! Object runtime scenarios driven directly through the manager
//!
//! These run on the test's own runtime thread; nothing here goes through
//! HTTP or the world thread.

use std::collections::BTreeMap;
use std::time::Duration;

use protomud::bootstrap::bootstrap;
use protomud::objects::{
    CallOptions, MethodDef, MethodOptions, Methods, ObjectHandle, ObjectManager, ObjectStore,
    Properties, Value, ROOT_ID,
};
use protomud::{RuntimeConfig, RuntimeError};
use tempfile::TempDir;

async fn open_memory() -> ObjectManager {
    let store = ObjectStore::connect(None).await.unwrap();
    ObjectManager::open(store, RuntimeConfig::default())
        .await
        .unwrap()
}

async fn open_file(path: &str) -> ObjectManager {
    let store = ObjectStore::connect(Some(path)).await.unwrap();
    ObjectManager::open(store, RuntimeConfig::default())
        .await
        .unwrap()
}

fn props(pairs: &[(&str, Value)]) -> Properties {
    pairs
        .iter()
        .map(|(k, v)| (k.to_string(), v.clone()))
        .collect()
}

async fn child_of(manager: &ObjectManager, parent: &ObjectHandle, properties: Properties) -> ObjectHandle {
    manager
        .create(Some(parent.id()), properties, Methods::new())
        .await
        .unwrap()
}

#[tokio::test]
async fn test_inherited_and_overridden_properties() {
    let manager = open_memory().await;
    let monster = manager
        .create(Some(ROOT_ID), props(&[("hp", Value::Int(100))]), Methods::new())
        .await
        .unwrap();
    let goblin = child_of(&manager, &monster, Properties::new()).await;
    let rat = child_of(&manager, &monster, props(&[("hp", Value::Int(80))])).await;

    assert_eq!(goblin.get("hp").await.unwrap(), Some(Value::Int(100)));
    assert_eq!(goblin.get_own("hp"), None);
    assert_eq!(rat.get("hp").await.unwrap(), Some(Value::Int(80)));

    // A prototype change shows through to children that do not override it
    monster.set("hp", 120).await.unwrap();
    assert_eq!(goblin.get("hp").await.unwrap(), Some(Value::Int(120)));
    assert_eq!(rat.get("hp").await.unwrap(), Some(Value::Int(80)));
}

#[tokio::test]
async fn test_method_write_survives_eviction() {
    let manager = open_memory().await;
    let monster = manager
        .create(Some(ROOT_ID), props(&[("hp", Value::Int(100))]), Methods::new())
        .await
        .unwrap();
    monster
        .set_method(
            "takeDamage",
            "self.hp = self.hp - args[1]\nreturn self.hp",
            MethodOptions::default(),
        )
        .await
        .unwrap();
    let goblin = child_of(&manager, &monster, Properties::new()).await;
    let id = goblin.id();

    let result = goblin.call("takeDamage", vec![Value::Int(25)]).await.unwrap();
    assert_eq!(result, Value::Int(75));
    // The write landed on the receiver, not the definer
    assert_eq!(goblin.get_own("hp"), Some(Value::Int(75)));
    assert_eq!(monster.get_own("hp"), Some(Value::Int(100)));

    assert!(manager.evict(id).await);
    assert!(!manager.is_cached(id));
    let reloaded = manager.load(id).await.unwrap();
    assert!(!ObjectHandle::ptr_eq(&goblin, &reloaded));
    assert_eq!(reloaded.get("hp").await.unwrap(), Some(Value::Int(75)));
}

/// Create #2..=#10, recycle `order`, then create three more
async fn reuse_after_recycling(order: [i64; 2]) -> Vec<i64> {
    let manager = open_memory().await;
    let mut handles = Vec::new();
    for _ in 0..9 {
        handles.push(
            manager
                .create(Some(ROOT_ID), Properties::new(), Methods::new())
                .await
                .unwrap(),
        );
    }
    let ids: Vec<_> = handles.iter().map(|h| h.id()).collect();
    assert_eq!(ids, (2..=10).collect::<Vec<_>>());

    for id in order {
        let handle = handles.iter().find(|h| h.id() == id).unwrap();
        manager.recycle(handle).await.unwrap();
        assert!(!handle.is_valid());
        assert!(matches!(manager.load(id).await, Err(RuntimeError::NotFound(i)) if i == id));
    }

    let mut next = Vec::new();
    for _ in 0..3 {
        let handle = manager
            .create(Some(ROOT_ID), Properties::new(), Methods::new())
            .await
            .unwrap();
        next.push(handle.id());
    }
    next
}

#[tokio::test]
async fn test_recycled_ids_reused_lowest_first() {
    assert_eq!(reuse_after_recycling([5, 9]).await, vec![5, 9, 11]);
    assert_eq!(reuse_after_recycling([9, 5]).await, vec![5, 9, 11]);
}

#[tokio::test]
async fn test_stale_handle_after_id_reuse() {
    let manager = open_memory().await;
    let old = manager
        .create(Some(ROOT_ID), props(&[("name", Value::from("old"))]), Methods::new())
        .await
        .unwrap();
    let id = old.id();
    manager.recycle(&old).await.unwrap();

    let new = manager
        .create(Some(ROOT_ID), Properties::new(), Methods::new())
        .await
        .unwrap();
    assert_eq!(new.id(), id);
    new.set("owner", "b").await.unwrap();

    assert!(matches!(old.set("x", 1).await, Err(RuntimeError::NotFound(_))));
    assert!(new.is_valid());

    manager.evict(id).await;
    let reloaded = manager.load(id).await.unwrap();
    assert_eq!(reloaded.get_own("owner"), Some(Value::from("b")));
    assert_eq!(reloaded.get_own("name"), None);
}

#[tokio::test]
async fn test_sparse_table_result_is_a_map() {
    let manager = open_memory().await;
    let thing = manager
        .create(Some(ROOT_ID), Properties::new(), Methods::new())
        .await
        .unwrap();
    thing
        .set_method(
            "sparse",
            "self.marks = { [100000000] = true }\nreturn self.marks",
            MethodOptions::default(),
        )
        .await
        .unwrap();

    let options = CallOptions::default().with_timeout(Duration::from_millis(500));
    let result = thing.call_with("sparse", vec![], options).await.unwrap();
    let expected = Value::Map(BTreeMap::from([("100000000".to_string(), Value::Bool(true))]));
    assert_eq!(result, expected);
    assert_eq!(thing.get_own("marks"), Some(expected));
}

#[tokio::test]
async fn test_core_objects_are_protected() {
    let manager = open_memory().await;
    let root = manager.load(ROOT_ID).await.unwrap();
    let holder = manager.load(0).await.unwrap();

    assert!(matches!(manager.recycle(&root).await, Err(RuntimeError::Protected(1))));
    assert!(matches!(manager.recycle(&holder).await, Err(RuntimeError::Protected(0))));
}

#[tokio::test]
async fn test_alias_lifecycle() {
    let manager = open_memory().await;
    let lobby = manager
        .create(Some(ROOT_ID), props(&[("name", Value::from("Lobby"))]), Methods::new())
        .await
        .unwrap();

    manager.register_alias("lobby", &lobby).await.unwrap();
    let direct = manager.alias("lobby").unwrap();
    assert!(ObjectHandle::ptr_eq(&direct, &lobby));

    // Direct access is cache-only; resolve_alias loads on demand
    manager.evict(lobby.id()).await;
    assert!(matches!(
        manager.alias("lobby"),
        Err(RuntimeError::HandleNotCached(_))
    ));
    let resolved = manager.resolve_alias("lobby").await.unwrap();
    assert_eq!(resolved.get("name").await.unwrap(), Some(Value::from("Lobby")));

    assert!(matches!(
        manager.register_alias("not valid", &resolved).await,
        Err(RuntimeError::InvalidAlias(_))
    ));

    assert_eq!(manager.remove_alias("lobby").await.unwrap(), Some(resolved.id()));
    assert_eq!(manager.remove_alias("lobby").await.unwrap(), None);
    assert!(matches!(
        manager.alias("lobby"),
        Err(RuntimeError::AliasNotRegistered(_))
    ));
}

#[tokio::test]
async fn test_recycle_drops_aliases() {
    let manager = open_memory().await;
    let temp = manager
        .create(Some(ROOT_ID), Properties::new(), Methods::new())
        .await
        .unwrap();
    manager.register_alias("scratch", &temp).await.unwrap();

    manager.recycle(&temp).await.unwrap();
    assert!(!manager.aliases().contains_key("scratch"));
    assert!(matches!(
        manager.resolve_alias("scratch").await,
        Err(RuntimeError::AliasNotRegistered(_))
    ));
}

#[tokio::test]
async fn test_pass_chain_runs_toward_root() {
    let manager = open_memory().await;
    let base = manager
        .create(Some(ROOT_ID), Properties::new(), Methods::new())
        .await
        .unwrap();
    base.set_method("describe", "return 'base(' .. args[1] .. ')'", MethodOptions::default())
        .await
        .unwrap();

    let middle = child_of(&manager, &base, Properties::new()).await;
    middle
        .set_method(
            "describe",
            "return 'middle>' .. pass(args[1] .. '!')",
            MethodOptions::default(),
        )
        .await
        .unwrap();

    let leaf = child_of(&manager, &middle, props(&[("name", Value::from("leaf"))])).await;
    leaf.set_method(
        "describe",
        "return self.name .. '>' .. pass(args[1])",
        MethodOptions::default(),
    )
    .await
    .unwrap();

    let result = leaf.call("describe", vec![Value::from("x")]).await.unwrap();
    assert_eq!(result, Value::from("leaf>middle>base(x!)"));
}

#[tokio::test]
async fn test_pass_without_ancestor_is_script_error() {
    let manager = open_memory().await;
    let only = manager
        .create(Some(ROOT_ID), Properties::new(), Methods::new())
        .await
        .unwrap();
    only.set_method("lonely", "return pass()", MethodOptions::default())
        .await
        .unwrap();

    match only.call("lonely", vec![]).await {
        Err(RuntimeError::Script { object, method, .. }) => {
            assert_eq!(object, only.id());
            assert_eq!(method, "lonely");
        }
        other => panic!("expected script error, got {:?}", other),
    }
}

#[tokio::test]
async fn test_call_failures() {
    let manager = open_memory().await;
    let thing = manager
        .create(Some(ROOT_ID), Properties::new(), Methods::new())
        .await
        .unwrap();

    assert!(matches!(
        thing.call("missing", vec![]).await,
        Err(RuntimeError::MethodNotFound { .. })
    ));

    // Bad source is stored as-is and rejected on first call
    thing
        .set_method("broken", "return (", MethodOptions::default())
        .await
        .unwrap();
    assert!(matches!(
        thing.call("broken", vec![]).await,
        Err(RuntimeError::CompileError { .. })
    ));

    thing
        .set_method("boom", "error('kaboom')", MethodOptions::default())
        .await
        .unwrap();
    match thing.call("boom", vec![]).await {
        Err(RuntimeError::Script { message, .. }) => assert!(message.contains("kaboom")),
        other => panic!("expected script error, got {:?}", other),
    }

    // Fixing the source takes effect on the next call
    thing
        .set_method("broken", "return 42", MethodOptions::default())
        .await
        .unwrap();
    assert_eq!(thing.call("broken", vec![]).await.unwrap(), Value::Int(42));
}

#[tokio::test]
async fn test_concurrent_calls_on_one_object_serialize() {
    let manager = open_memory().await;
    let target = manager
        .create(Some(ROOT_ID), props(&[("hp", Value::Int(100))]), Methods::new())
        .await
        .unwrap();
    // The load forces a suspension between the read and the write
    target
        .set_method(
            "hit",
            "local hp = self.hp\nworld:load(1)\nself.hp = hp - args[1]",
            MethodOptions::default(),
        )
        .await
        .unwrap();

    let (a, b) = tokio::join!(
        target.call("hit", vec![Value::Int(10)]),
        target.call("hit", vec![Value::Int(10)]),
    );
    a.unwrap();
    b.unwrap();
    assert_eq!(target.get("hp").await.unwrap(), Some(Value::Int(80)));
}

#[tokio::test]
async fn test_reentrant_call_on_same_object() {
    let manager = open_memory().await;
    let counter = manager
        .create(Some(ROOT_ID), props(&[("n", Value::Int(0))]), Methods::new())
        .await
        .unwrap();
    counter
        .set_method("bump", "self.n = self.n + 1\nreturn self.n", MethodOptions::default())
        .await
        .unwrap();
    counter
        .set_method(
            "bump_twice",
            "self:call('bump')\nreturn self:call('bump')",
            MethodOptions::default(),
        )
        .await
        .unwrap();

    assert_eq!(counter.call("bump_twice", vec![]).await.unwrap(), Value::Int(2));
}

#[tokio::test]
async fn test_runaway_method_hits_deadline() {
    let manager = open_memory().await;
    let spinner = manager
        .create(Some(ROOT_ID), Properties::new(), Methods::new())
        .await
        .unwrap();
    spinner
        .set_method("spin", "while true do end", MethodOptions::default())
        .await
        .unwrap();
    spinner
        .set_method("ok", "return 'fine'", MethodOptions::default())
        .await
        .unwrap();

    let options = CallOptions::default().with_timeout(Duration::from_millis(100));
    assert!(matches!(
        spinner.call_with("spin", vec![], options).await,
        Err(RuntimeError::DeadlineExceeded)
    ));

    // The object stays usable after a timed-out chain
    assert_eq!(spinner.call("ok", vec![]).await.unwrap(), Value::from("fine"));
}

#[tokio::test]
async fn test_find_skips_recycled() {
    let manager = open_memory().await;
    let a = manager
        .create(Some(ROOT_ID), props(&[("kind", Value::from("key"))]), Methods::new())
        .await
        .unwrap();
    let b = manager
        .create(Some(ROOT_ID), props(&[("kind", Value::from("key"))]), Methods::new())
        .await
        .unwrap();

    let found = manager
        .find_by_property("kind", &Value::from("key"))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(found.id(), a.id());

    manager.recycle(&a).await.unwrap();
    let keys = manager
        .find_all(|h| h.get_own("kind") == Some(Value::from("key")))
        .await
        .unwrap();
    assert_eq!(keys.iter().map(|h| h.id()).collect::<Vec<_>>(), vec![b.id()]);
}

#[tokio::test]
async fn test_lua_world_bindings() {
    let manager = open_memory().await;
    let lobby = manager
        .create(Some(ROOT_ID), props(&[("name", Value::from("Lobby"))]), Methods::new())
        .await
        .unwrap();
    manager.register_alias("lobby", &lobby).await.unwrap();

    let builder = manager
        .create(Some(ROOT_ID), Properties::new(), Methods::new())
        .await
        .unwrap();
    builder
        .set_method(
            "build",
            r#"
local room = world:create(world.lobby, { exits = { "north", "south" } })
room.name = "Hall"
world:alias("hall", room)
return room
"#,
            MethodOptions::default(),
        )
        .await
        .unwrap();

    let result = builder.call("build", vec![]).await.unwrap();
    let room = result
        .as_objref()
        .unwrap()
        .resolve(&manager)
        .await
        .unwrap();

    assert_eq!(room.parent(), Some(lobby.id()));
    assert_eq!(room.get("name").await.unwrap(), Some(Value::from("Hall")));
    assert_eq!(
        room.get("exits").await.unwrap(),
        Some(Value::List(vec![Value::from("north"), Value::from("south")]))
    );
    assert_eq!(manager.aliases().get("hall"), Some(&room.id()));

    builder
        .set_method("who", "return world.nowhere", MethodOptions::default())
        .await
        .unwrap();
    match builder.call("who", vec![]).await {
        Err(RuntimeError::Script { message, .. }) => assert!(message.contains("not registered")),
        other => panic!("expected script error, got {:?}", other),
    }
}

#[tokio::test]
async fn test_lua_direct_access_is_cache_only() {
    let manager = open_memory().await;
    let lobby = manager
        .create(Some(ROOT_ID), props(&[("name", Value::from("Lobby"))]), Methods::new())
        .await
        .unwrap();
    manager.register_alias("lobby", &lobby).await.unwrap();
    let lobby_id = lobby.id();

    let reader = manager
        .create(Some(ROOT_ID), Properties::new(), Methods::new())
        .await
        .unwrap();
    reader
        .set_method("by_alias", "return world.lobby.name", MethodOptions::default())
        .await
        .unwrap();
    reader
        .set_method("by_id", "return world[args[1]].name", MethodOptions::default())
        .await
        .unwrap();
    reader
        .set_method("by_load", "return world:load(args[1]).name", MethodOptions::default())
        .await
        .unwrap();

    let id_arg = vec![Value::Int(lobby_id)];
    assert_eq!(reader.call("by_alias", vec![]).await.unwrap(), Value::from("Lobby"));
    assert_eq!(reader.call("by_id", id_arg.clone()).await.unwrap(), Value::from("Lobby"));

    drop(lobby);
    assert!(manager.evict(lobby_id).await);

    for method in ["by_alias", "by_id"] {
        match reader.call(method, id_arg.clone()).await {
            Err(RuntimeError::Script { message, .. }) => {
                assert!(message.contains("not cached"), "{method}: {message}")
            }
            other => panic!("{method}: expected script error, got {:?}", other),
        }
    }

    // Loading brings it back, after which direct access works again
    assert_eq!(reader.call("by_load", id_arg.clone()).await.unwrap(), Value::from("Lobby"));
    assert_eq!(reader.call("by_alias", vec![]).await.unwrap(), Value::from("Lobby"));
}

#[tokio::test]
async fn test_bootstrap_is_idempotent() {
    let manager = open_memory().await;
    let first = bootstrap(&manager, &BTreeMap::new()).await.unwrap();
    assert!(first.router_created.is_some());
    assert!(!first.is_noop());

    let second = bootstrap(&manager, &BTreeMap::new()).await.unwrap();
    assert!(second.is_noop());

    let router = manager.alias("router").unwrap();
    assert_eq!(router.call("ping", vec![]).await.unwrap(), Value::from("pong"));
}

#[tokio::test]
async fn test_world_persists_across_reopen() {
    let temp_dir = TempDir::new().unwrap();
    let path = temp_dir.path().join("world.db");
    let path = path.to_str().unwrap();

    let id = {
        let manager = open_file(path).await;
        let mut methods = Methods::new();
        methods.insert(
            "greet".to_string(),
            MethodDef::with_options("return 'hello, ' .. args[1]", MethodOptions::command(&["hi"])),
        );
        let npc = manager
            .create(Some(ROOT_ID), props(&[("mood", Value::from("cheerful"))]), methods)
            .await
            .unwrap();
        npc.set("friends", Value::List(vec![Value::from(&npc)]))
            .await
            .unwrap();
        manager.register_alias("npc", &npc).await.unwrap();
        manager.shutdown();
        manager.store().disconnect().await;
        npc.id()
    };

    let manager = open_file(path).await;
    let npc = manager.resolve_alias("npc").await.unwrap();
    assert_eq!(npc.id(), id);
    assert_eq!(npc.get("mood").await.unwrap(), Some(Value::from("cheerful")));
    assert_eq!(npc.resolve_command("hi").await.unwrap(), Some("greet".to_string()));
    assert_eq!(
        npc.call("greet", vec![Value::from("you")]).await.unwrap(),
        Value::from("hello, you")
    );

    let friends = npc.get("friends").await.unwrap();
    let Some(Value::List(friends)) = friends else {
        panic!("expected a list, got {:?}", friends);
    };
    assert_eq!(friends[0].as_objref().map(|r| r.id()), Some(id));

    // New ids continue above the highest stored id
    let fresh = manager
        .create(Some(ROOT_ID), Properties::new(), Methods::new())
        .await
        .unwrap();
    assert!(fresh.id() > id);
}
