/// Per-collection numbers published to the caller's sink.
#[derive(Clone, Copy, Debug, Default)]
pub struct ScavengeStats {
    /// Promotion age threshold in effect after this collection.
    pub lifetime: u8,
    /// Occupancy of the survivor half holding this cycle's survivors.
    pub percentage_used: f64,
    /// Objects moved to the mature space, whether by age or by spill.
    pub promoted_objects: usize,
    /// Promotions forced because the to-space ran out of room.
    pub excess_objects: usize,
}

impl std::fmt::Display for ScavengeStats {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(f, "Young collection:")?;
        writeln!(f, "  Lifetime: {}", self.lifetime)?;
        writeln!(f, "  Survivor used: {:.1}%", self.percentage_used)?;
        writeln!(f, "  Promoted objects: {}", self.promoted_objects)?;
        writeln!(f, "  Excess objects: {}", self.excess_objects)?;
        Ok(())
    }
}
