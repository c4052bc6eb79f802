use kinpoint_models::family::Geofence;

use crate::{RepoError, RepoHandle};

/// Enabled geofences for a family. Disabled fences are filtered at the
/// source so the cache never carries them.
pub async fn geofences_of(repo: &RepoHandle, family_id: &str) -> Result<Vec<Geofence>, RepoError> {
    let query = format!(
        "select=id,family_id,name,center_lat,center_lon,radius_m,enabled\
         &family_id=eq.{family_id}&enabled=eq.true"
    );
    repo.select("geofences", &query, None).await
}
