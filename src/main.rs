//! Glomerate - entity component store demo
//!
//! Fires missiles at a handful of characters and lets event handlers and
//! queries deal with the fallout.

mod settings;

use std::cell::Cell;
use std::rc::Rc;

use anyhow::{Context, Result};
use glomerate_ecs::{Entity, EntityDestroyed, EntityManager};
use tracing::info;
use tracing_subscriber::FmtSubscriber;

use settings::Settings;

/// Component: where a character stands
#[derive(Debug, Clone, Copy, PartialEq)]
struct Position {
    x: i32,
    y: i32,
}

/// Component: display name
#[derive(Debug, Clone, PartialEq)]
struct Name(String);

/// Keyed component: which side a character fights for
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
enum Team {
    Red,
    Blue,
}

/// Event: a missile is about to land on a character's square
struct IncomingMissile {
    x: i32,
    y: i32,
}

/// Event: something exploded at a square
struct Explosion {
    x: i32,
    y: i32,
}

/// Global event: end of a simulation round
struct RoundOver(u32);

fn spawn(em: &EntityManager, name: &str, x: i32, y: i32, team: Team) -> Result<Entity> {
    let e = em.create();
    em.attach(e, Name(name.to_string()))?;
    em.attach(e, Position { x, y })?;
    em.attach_key(e, team)?;
    Ok(e)
}

fn name_of(em: &EntityManager, e: Entity) -> String {
    em.get::<Name>(e)
        .map(|name| name.0.clone())
        .unwrap_or_else(|_| e.to_string())
}

fn fire_at(em: &EntityManager, target: Entity) -> Result<()> {
    let at = *em.get::<Position>(target)?;
    info!("Firing a missile at {}", name_of(em, target));
    em.emit(target, &IncomingMissile { x: at.x, y: at.y });
    em.emit(target, &Explosion { x: at.x, y: at.y });
    Ok(())
}

fn main() -> Result<()> {
    let (settings, outcome) = Settings::load();

    // Initialize logging
    let subscriber = FmtSubscriber::builder()
        .with_max_level(settings.logging.max_level())
        .with_target(settings.logging.show_target)
        .finish();
    tracing::subscriber::set_global_default(subscriber)
        .context("Failed to set tracing subscriber")?;
    outcome.report();

    info!("Starting glomerate demo...");
    let em = EntityManager::with_config(settings.ecs.clone());

    // announce character deaths when they occur
    em.subscribe::<EntityDestroyed>(|em, e, _| {
        if em.has::<Name>(e).unwrap_or(false) {
            info!("{} has died", name_of(em, e));
        }
    });

    let player = spawn(&em, "Player", 1, 1, Team::Blue)?;
    let grunts = [
        spawn(&em, "Grunt A", 4, 2, Team::Red)?,
        spawn(&em, "Grunt B", 6, 2, Team::Red)?,
        spawn(&em, "Grunt C", 8, 2, Team::Red)?,
    ];

    // the player is smart and moves out of the way of missiles
    let mut dodging = em.subscribe_entity::<IncomingMissile>(player, |em, e, missile| {
        let Ok(at) = em.get::<Position>(e).map(|p| *p) else {
            return;
        };
        if at.x == missile.x && at.y == missile.y {
            info!("{} has moved out of the way!", name_of(em, e));
            let _ = em.attach(e, Position { x: at.x + 10, y: at.y });
        }
    })?;

    // explosions destroy whatever stands on their square
    let explosions_seen = Rc::new(Cell::new(0u32));
    let seen = Rc::clone(&explosions_seen);
    em.subscribe::<Explosion>(move |em, e, explosion| {
        seen.set(seen.get() + 1);
        let hit = em
            .get::<Position>(e)
            .map(|p| p.x == explosion.x && p.y == explosion.y)
            .unwrap_or(false);
        if hit {
            let _ = em.destroy(e);
        }
    });

    em.subscribe_global::<RoundOver>(|em, round| {
        info!("Round {} over, {} entities standing", round.0, em.entity_count());
    });

    fire_at(&em, player)?;
    info!("{} stops paying attention (Uh oh)", name_of(&em, player));
    dodging.unsubscribe();
    fire_at(&em, player)?;
    em.emit_global(&RoundOver(1));

    // shoot at every red grunt; each hit destroys the grunt mid-query
    for grunt in em.entities_with_key::<Team, (Position,)>(&Team::Red)? {
        fire_at(&em, grunt)?;
    }
    em.emit_global(&RoundOver(2));

    info!(
        "The explosion handler saw {} explosions; {} of {} grunts survived",
        explosions_seen.get(),
        grunts.iter().filter(|g| em.valid(**g)).count(),
        grunts.len()
    );

    let survivors = em.entities_with::<(Name, Position)>()?.count();
    let blue = em.entities_with_key::<Team, ()>(&Team::Blue)?.count();
    info!("{survivors} named entities left, {blue} blue");

    em.destroy_all()?;
    Ok(())
}
