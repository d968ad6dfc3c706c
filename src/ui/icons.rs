//! Shared UI icons.

use console::Emoji;

// Phase outcomes
pub static CHECK: Emoji<'_, '_> = Emoji("✅ ", "[OK]");
pub static CROSS: Emoji<'_, '_> = Emoji("❌ ", "[ERR]");
pub static SKIP: Emoji<'_, '_> = Emoji("⏭️  ", "[SKIP]");
pub static CLOCK: Emoji<'_, '_> = Emoji("⏱️  ", "[T]");
pub static WARN: Emoji<'_, '_> = Emoji("⚠️  ", "[WARN]");

// Pipeline events
pub static RUNNING: Emoji<'_, '_> = Emoji("▶️  ", "[>]");
pub static LOOP: Emoji<'_, '_> = Emoji("🔄 ", "[LOOP]");
pub static BROOM: Emoji<'_, '_> = Emoji("🧹 ", "[CLEAN]");
pub static SPARKLE: Emoji<'_, '_> = Emoji("✨ ", "*");
