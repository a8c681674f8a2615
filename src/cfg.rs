macro_rules! cfg_client {
    ($($item:item)*) => {
        $(
            #[cfg(feature = "client")]
            #[cfg_attr(docsrs, doc(cfg(feature = "client")))]
            $item
        )*
    }
}

macro_rules! cfg_server {
    ($($item:item)*) => {
        $(
            #[cfg(feature = "server")]
            #[cfg_attr(docsrs, doc(cfg(feature = "server")))]
            $item
        )*
    }
}

macro_rules! cfg_registry {
    ($($item:item)*) => {
        $(
            #[cfg(feature = "registry")]
            #[cfg_attr(docsrs, doc(cfg(feature = "registry")))]
            $item
        )*
    }
}

macro_rules! cfg_discovery {
    ($($item:item)*) => {
        $(
            #[cfg(feature = "discovery")]
            #[cfg_attr(docsrs, doc(cfg(feature = "discovery")))]
            $item
        )*
    }
}
