/*!
SAPHIR KERNEL - Noyau de synchronisation d'état pour périphériques embarqués

Les devices parlent exclusivement via un bus publish/subscribe non fiable
(at-most-once, non ordonné). Ce crate en fait une source de vérité exploitable :

- `classify` : parsing des couples topic/payload en événements typés
- `store` : miroir canonique par device, muté uniquement par les événements classifiés
- `presence` : heuristique de vivacité (flag auto-déclaré ET fraîcheur des messages)
- `dispatch` : émulation requête/réponse (commande + attente d'écho + timeout)
- `transport` : contrat minimal attendu du client pub/sub (broker réel ou mock)

Le binaire `saphir-kernel` assemble le tout : config, listener rumqttc,
publication health et API REST Axum.
*/

pub mod classify;
pub mod config;
pub mod dispatch;
pub mod health;
pub mod http;
pub mod models;
pub mod mqtt;
pub mod presence;
pub mod store;
pub mod transport;
