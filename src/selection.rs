use crate::domain::GardenRef;

/// pick the garden to show on load
///
/// tiers, first match wins: the persisted selection, the externally supplied
/// hint, the first garden. ids that are not in `gardens` never win.
pub fn initial_selection(
    persisted: Option<&str>,
    hint: Option<&str>,
    gardens: &[GardenRef],
) -> Option<String> {
    let known = |id: &str| gardens.iter().any(|g| g.id == id);
    persisted
        .filter(|id| known(id))
        .or_else(|| hint.filter(|id| known(id)))
        .map(str::to_string)
        .or_else(|| gardens.first().map(|g| g.id.clone()))
}
