use async_trait::async_trait;

/// État du lien vers le broker, interrogeable de façon synchrone.
/// Sert au fast-reject du dispatcher : inutile d'attendre plusieurs secondes
/// une confirmation qui ne peut pas arriver.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkStatus {
    Connected,
    Connecting,
    Error,
}

impl LinkStatus {
    pub fn is_connected(self) -> bool {
        matches!(self, LinkStatus::Connected)
    }
}

impl std::fmt::Display for LinkStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            LinkStatus::Connected => "connected",
            LinkStatus::Connecting => "connecting",
            LinkStatus::Error => "error",
        };
        f.write_str(s)
    }
}

/// Contrat minimal attendu du client pub/sub. Le noyau ne dépend d'aucune
/// implémentation : broker réel via rumqttc côté kernel, mock du devkit en
/// test. La gestion de connexion/reconnexion/TLS reste chez l'implémentation.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn publish(&self, topic: &str, payload: String, retained: bool) -> anyhow::Result<()>;
    fn link_status(&self) -> LinkStatus;
}
