//! Recipe graph scenarios: canonical normalization, stable text, digest
//! identity, and the resolvability predicate.

use weft::recipe::{Direction, Fate, Recipe, TypeDecl};

/// Particles P and Q connected through one handle, plus an interface-typed
/// connection on Q.
fn p_q_recipe() -> Recipe {
    let mut recipe = Recipe::new(Some("PassThrough".into()));
    let q = recipe.add_particle("Q");
    let p = recipe.add_particle("P");

    let shared = recipe.add_handle();
    {
        let handle = recipe.handle_mut(shared);
        handle.fate = Fate::Create;
        handle.tags.push("people".into());
        handle.ty = Some(TypeDecl::Collection(Box::new(TypeDecl::Entity {
            schema: "Person".into(),
        })));
    }

    let host = recipe.add_handle();
    {
        let handle = recipe.handle_mut(host);
        handle.fate = Fate::Use;
        handle.id = Some("host-store".into());
        handle.ty = Some(TypeDecl::Interface {
            name: "HostedParticle".into(),
        });
    }

    let q_host = recipe.add_handle_connection(q, "host");
    recipe.handle_connection_mut(q_host).direction = Some(Direction::Reads);
    recipe.handle_connection_mut(q_host).ty = Some(TypeDecl::Interface {
        name: "HostedParticle".into(),
    });
    recipe.connect_handle(q_host, host);

    let q_in = recipe.add_handle_connection(q, "people");
    recipe.handle_connection_mut(q_in).direction = Some(Direction::Reads);
    recipe.handle_connection_mut(q_in).ty = Some(TypeDecl::Collection(Box::new(
        TypeDecl::Entity {
            schema: "Person".into(),
        },
    )));
    recipe.connect_handle(q_in, shared);

    let p_out = recipe.add_handle_connection(p, "people");
    recipe.handle_connection_mut(p_out).direction = Some(Direction::Writes);
    recipe.handle_connection_mut(p_out).ty = Some(TypeDecl::Collection(Box::new(
        TypeDecl::Entity {
            schema: "Person".into(),
        },
    )));
    recipe.connect_handle(p_out, shared);

    recipe
}

#[test]
fn interface_typed_connections_sort_last() {
    let frozen = p_q_recipe().normalize().unwrap();
    let interface_flags: Vec<bool> = frozen
        .handle_connections()
        .iter()
        .map(|connection| connection.is_interface_typed())
        .collect();
    // Once interfaces start, nothing plain follows.
    let first = interface_flags.iter().position(|flag| *flag).unwrap();
    assert!(interface_flags[first..].iter().all(|flag| *flag));
    assert!(interface_flags[..first].iter().all(|flag| !flag));
}

#[test]
fn to_string_is_stable_across_runs() {
    let a = p_q_recipe().normalize().unwrap();
    let b = p_q_recipe().normalize().unwrap();
    assert_eq!(a.to_string(), b.to_string());
    assert_eq!(a.digest(), b.digest());

    // Synthetic names only for anonymous nodes.
    let text = a.to_string();
    assert!(text.contains("handle0"));
    assert!(text.contains("P as particle0"));
    assert!(text.contains("Q as particle1"));
}

#[test]
fn digest_distinguishes_different_recipes() {
    let base = p_q_recipe().normalize().unwrap();
    let mut other = p_q_recipe();
    other.add_verb("filter");
    let other = other.normalize().unwrap();
    assert_ne!(base.digest(), other.digest());
}

#[test]
fn normalization_is_terminal_and_repeatable() {
    let frozen = p_q_recipe().normalize().unwrap();
    // Thawing and renormalizing reproduces the same canonical form.
    let (thawed, clone_map) = frozen.clone_recipe();
    assert_eq!(clone_map.particles.len(), frozen.particles().len());
    let again = thawed.normalize().unwrap();
    assert_eq!(frozen.to_string(), again.to_string());
}

#[test]
fn resolution_tracks_fates_and_bindings() {
    let frozen = p_q_recipe().normalize().unwrap();
    assert!(frozen.is_resolved());

    // Remove a fate: resolution fails, validity holds.
    let mut unfated = p_q_recipe();
    let orphan = unfated.add_handle();
    unfated.handle_mut(orphan).fate = Fate::Unknown;
    let frozen = unfated.normalize().unwrap();
    assert!(!frozen.is_resolved());
}

#[test]
fn search_gates_resolution_until_tokens_resolve() {
    let mut recipe = p_q_recipe();
    recipe.set_search("people nearby");
    let frozen = recipe.normalize().unwrap();
    assert!(!frozen.is_resolved());

    let (mut thawed, _) = frozen.clone_recipe();
    {
        let search = thawed.search_mut().unwrap();
        assert!(search.resolve_token("people"));
        assert!(search.resolve_token("nearby"));
    }
    assert!(thawed.normalize().unwrap().is_resolved());
}

#[test]
fn scrambled_construction_orders_converge_to_one_digest() {
    // Build the same graph twice with different insertion orders.
    let forward = p_q_recipe().normalize().unwrap();

    let mut scrambled = Recipe::new(Some("PassThrough".into()));
    let p = scrambled.add_particle("P");
    let q = scrambled.add_particle("Q");

    let host = scrambled.add_handle();
    {
        let handle = scrambled.handle_mut(host);
        handle.fate = Fate::Use;
        handle.id = Some("host-store".into());
        handle.ty = Some(TypeDecl::Interface {
            name: "HostedParticle".into(),
        });
    }
    let shared = scrambled.add_handle();
    {
        let handle = scrambled.handle_mut(shared);
        handle.fate = Fate::Create;
        handle.tags.push("people".into());
        handle.ty = Some(TypeDecl::Collection(Box::new(TypeDecl::Entity {
            schema: "Person".into(),
        })));
    }

    let p_out = scrambled.add_handle_connection(p, "people");
    scrambled.handle_connection_mut(p_out).direction = Some(Direction::Writes);
    scrambled.handle_connection_mut(p_out).ty = Some(TypeDecl::Collection(Box::new(
        TypeDecl::Entity {
            schema: "Person".into(),
        },
    )));
    scrambled.connect_handle(p_out, shared);

    let q_in = scrambled.add_handle_connection(q, "people");
    scrambled.handle_connection_mut(q_in).direction = Some(Direction::Reads);
    scrambled.handle_connection_mut(q_in).ty = Some(TypeDecl::Collection(Box::new(
        TypeDecl::Entity {
            schema: "Person".into(),
        },
    )));
    scrambled.connect_handle(q_in, shared);

    let q_host = scrambled.add_handle_connection(q, "host");
    scrambled.handle_connection_mut(q_host).direction = Some(Direction::Reads);
    scrambled.handle_connection_mut(q_host).ty = Some(TypeDecl::Interface {
        name: "HostedParticle".into(),
    });
    scrambled.connect_handle(q_host, host);

    let scrambled = scrambled.normalize().unwrap();
    assert_eq!(forward.to_string(), scrambled.to_string());
    assert_eq!(forward.digest(), scrambled.digest());
}
